//! The Flan runtime: value model, managed heap and interpreter.
//!
//! A [`Vm`] is a fresh instance per run: construct it from a loaded
//! [`flan_bytecode::Image`], call [`Vm::run`], and tear the whole thing down
//! afterwards. The heap owns every object the program creates; values never
//! outlive the VM instance.

pub mod config;
pub mod error;
pub mod gc;
pub mod value;
pub mod vm;

pub use config::VmConfig;
pub use error::{Diagnostic, RuntimeError, RuntimeErrorKind};
pub use value::Value;
pub use vm::Vm;
