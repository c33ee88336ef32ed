use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Empty identifier not allowed")]
    EmptyIdentifier,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by clients for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Corruption(_) => "CORRUPTION",
            Error::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Error::EmptyIdentifier => "EMPTY_IDENTIFIER",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// Only IO failures are considered transient; a corrupted log or a bad
    /// key will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Adds context to an error by wrapping it in an Internal error.
    pub fn with_context(self, context: &str) -> Error {
        Error::Internal(format!("{}: {}", context, self))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
