//! Runtime errors and the diagnostic the CLI prints for them.

use std::fmt;

use smol_str::SmolStr;
use thiserror::Error;

use flan_bytecode::{ErrorInfo, ImageError};

/// What went wrong, at the granularity the diagnostic cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// Malformed image discovered mid-execution
    Load,
    /// Operands of incompatible kinds
    TypeMismatch,
    /// Well-typed but out of domain: zero divisor, bad index, arity mismatch
    Domain,
    /// Global binding missing or already taken
    Name,
    /// Call depth exceeded the frame cap
    StackOverflow,
    /// The image did something the compiler promises never to emit
    Internal,
}

/// A fatal execution error. Every runtime error aborts the program; `blame`
/// points into the image's error-info table when the failing instruction
/// carried an index.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub blame: Option<u16>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, blame: Option<u16>, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
            blame,
        }
    }

    pub fn type_mismatch(blame: impl Into<Option<u16>>, message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::TypeMismatch, blame.into(), message)
    }

    pub fn domain(blame: u16, message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Domain, Some(blame), message)
    }

    pub fn name(blame: u16, message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Name, Some(blame), message)
    }

    pub fn overflow(blame: u16, message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::StackOverflow, Some(blame), message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Internal, None, message)
    }
}

impl From<ImageError> for RuntimeError {
    fn from(err: ImageError) -> Self {
        Self::new(RuntimeErrorKind::Load, None, err.to_string())
    }
}

/// A runtime error resolved against the image: the blamed source line (when
/// the instruction carried one) and the live call chain, innermost first.
#[derive(Debug)]
pub struct Diagnostic {
    pub context: Option<ErrorInfo>,
    pub message: String,
    pub trace: Vec<SmolStr>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(info) => {
                writeln!(f, "{}", info.text)?;
                write!(f, "Error at line {}: {}", info.line, self.message)?;
            }
            None => write!(f, "Error: {}", self.message)?,
        }
        for name in &self.trace {
            write!(f, "\n  in {name}")?;
        }
        Ok(())
    }
}
