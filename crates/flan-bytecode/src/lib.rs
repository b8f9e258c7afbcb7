//! The binary image format of the Flan virtual machine.
//!
//! An image is a flat byte stream:
//!
//! ```text
//! magic "FLAN"   4 bytes
//! version        3 bytes
//! error info     u16 count, then (u16 line, u16 len, len bytes) per record
//! body           instruction stream, terminated by Halt (0xFF)
//! ```
//!
//! This crate owns the layout: the opcode and value-tag enums, the checked
//! cursor readers, and a writer used to assemble images.

pub mod inst;
pub mod reader;
pub mod writer;

use std::path::Path;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use smol_str::SmolStr;
use tracing::debug;

pub use reader::ImageError;

/// ASCII "FLAN".
pub const MAGIC: [u8; 4] = [0x46, 0x4C, 0x41, 0x4E];

/// Image version supported by this runtime. The first byte must match
/// exactly; the remaining bytes of an image must be less than or equal.
pub const VERSION: [u8; 3] = [0, 0, 0];

/// Tag byte in front of an inline constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ValueTag {
    Int = 0,
    Float = 1,
    /// Followed by one byte, 1 for true
    Bool = 2,
    Empty = 3,
    /// Long string: u16 length prefix
    Str = 4,
    /// Short string: u8 length prefix
    Atom = 5,
    /// Short-string name, u16 arity, integer body length, body, EndFn
    Function = 6,
}

/// One record of the error-info section: a source line an instruction can
/// blame when it fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorInfo {
    pub line: u16,
    pub text: SmolStr,
}

/// A loaded, header-validated image.
///
/// The instruction bytes stay in place for the VM's lifetime; function bodies
/// are views into this buffer.
#[derive(Debug)]
pub struct Image {
    bytes: Vec<u8>,
    error_info: Vec<ErrorInfo>,
    body_start: usize,
}

impl Image {
    /// Read and validate an image file.
    pub fn load(path: &Path) -> Result<Image, ImageError> {
        Image::parse(std::fs::read(path)?)
    }

    /// Validate the header and decode the error-info section.
    pub fn parse(bytes: Vec<u8>) -> Result<Image, ImageError> {
        let mut pos = 0;

        let magic: [u8; 4] = [
            reader::read_u8(&bytes, &mut pos)?,
            reader::read_u8(&bytes, &mut pos)?,
            reader::read_u8(&bytes, &mut pos)?,
            reader::read_u8(&bytes, &mut pos)?,
        ];
        if magic != MAGIC {
            return Err(ImageError::BadMagic);
        }

        let found = [
            reader::read_u8(&bytes, &mut pos)?,
            reader::read_u8(&bytes, &mut pos)?,
            reader::read_u8(&bytes, &mut pos)?,
        ];
        if found[0] != VERSION[0] || found[1] > VERSION[1] || found[2] > VERSION[2] {
            return Err(ImageError::UnsupportedVersion {
                found,
                supported: VERSION,
            });
        }

        let count = reader::read_u16(&bytes, &mut pos)?;
        let mut error_info = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let line = reader::read_u16(&bytes, &mut pos)?;
            let text = SmolStr::new(reader::read_long_str(&bytes, &mut pos)?);
            error_info.push(ErrorInfo { line, text });
        }

        debug!(
            version = ?found,
            error_info = error_info.len(),
            body_bytes = bytes.len() - pos,
            "accepted image header"
        );

        Ok(Image {
            bytes,
            error_info,
            body_start: pos,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Offset of the first instruction after the header sections.
    pub fn body_start(&self) -> usize {
        self.body_start
    }

    pub fn error_info(&self, idx: u16) -> Option<&ErrorInfo> {
        self.error_info.get(idx as usize)
    }
}
