use std::path::PathBuf;
use std::process::exit;

use clap::Parser as ClapParser;
use flan_bytecode::Image;
use flan_vm::Vm;

fn main() {
    let opt = Opt::parse();

    tracing_subscriber::FmtSubscriber::builder()
        .without_time()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let image = match Image::load(&opt.image) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("Error: {err}");
            exit(1);
        }
    };

    let mut vm = Vm::new(image);
    if let Err(err) = vm.run() {
        eprintln!("{}", vm.diagnose(&err));
        exit(1);
    }
}

#[derive(clap::Parser)]
#[clap(about, version, author)]
struct Opt {
    /// Compiled Flan image to execute.
    image: PathBuf,
}
