//! Cursor readers over a loaded image.
//!
//! Every reader takes the byte buffer and a mutable cursor, and advances the
//! cursor past what it consumed. Reads past the end of the buffer are
//! reported as [`ImageError::Truncated`] rather than panicking.

use smol_str::SmolStr;
use thiserror::Error;

/// Failure while loading or decoding an image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic number")]
    BadMagic,

    #[error("unsupported image version {found:?}, runtime supports {supported:?}")]
    UnsupportedVersion { found: [u8; 3], supported: [u8; 3] },

    #[error("image ended unexpectedly")]
    Truncated,

    #[error("unknown value tag 0x{0:02X}")]
    UnknownValueTag(u8),

    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("function body of `{0}` is not terminated")]
    UnterminatedFunction(SmolStr),

    #[error("malformed function body length {0}")]
    BadFunctionLength(i64),

    #[error("tuple length {0} exceeds 255")]
    OversizedTuple(u32),
}

pub fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8, ImageError> {
    let byte = *buf.get(*pos).ok_or(ImageError::Truncated)?;
    *pos += 1;
    Ok(byte)
}

pub fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, ImageError> {
    Ok(u16::from_le_bytes(read_array(buf, pos)?))
}

pub fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, ImageError> {
    Ok(u32::from_le_bytes(read_array(buf, pos)?))
}

pub fn read_integer(buf: &[u8], pos: &mut usize) -> Result<i64, ImageError> {
    Ok(i64::from_le_bytes(read_array(buf, pos)?))
}

pub fn read_float(buf: &[u8], pos: &mut usize) -> Result<f64, ImageError> {
    Ok(f64::from_le_bytes(read_array(buf, pos)?))
}

/// Read a `u8`-length-prefixed string.
pub fn read_short_str(buf: &[u8], pos: &mut usize) -> Result<SmolStr, ImageError> {
    let len = read_u8(buf, pos)? as usize;
    let bytes = read_slice(buf, pos, len)?;
    Ok(SmolStr::new(String::from_utf8_lossy(bytes)))
}

/// Read a `u16`-length-prefixed string.
pub fn read_long_str(buf: &[u8], pos: &mut usize) -> Result<String, ImageError> {
    let len = read_u16(buf, pos)? as usize;
    let bytes = read_slice(buf, pos, len)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Advance the cursor past `len` bytes without decoding them.
pub fn skip(buf: &[u8], pos: &mut usize, len: usize) -> Result<(), ImageError> {
    read_slice(buf, pos, len)?;
    Ok(())
}

fn read_slice<'b>(buf: &'b [u8], pos: &mut usize, len: usize) -> Result<&'b [u8], ImageError> {
    let end = pos.checked_add(len).ok_or(ImageError::Truncated)?;
    let slice = buf.get(*pos..end).ok_or(ImageError::Truncated)?;
    *pos = end;
    Ok(slice)
}

fn read_array<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N], ImageError> {
    let mut out = [0u8; N];
    out.copy_from_slice(read_slice(buf, pos, N)?);
    Ok(out)
}
