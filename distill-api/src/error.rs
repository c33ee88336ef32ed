use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Store(#[from] distill_core::Error),

    #[error("url not found")]
    NotFound,

    #[error("id already exists")]
    DuplicateId,

    #[error("Could not generate a free id after {0} attempts")]
    IdSpaceExhausted(u32),

    #[error("Invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Expiration date is before the activation date")]
    SubmittedAlreadyExpired,

    #[error("id {id:?} violates the id policy: {reason}")]
    IdConstraintViolation { id: String, reason: String },

    #[error("Invalid record at line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported backup format {0:?} (expected .bin or .csv)")]
    UnsupportedFormat(String),

    #[error("Session is closed")]
    SessionClosed,
}

impl Error {
    /// Returns a stable error code for this error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Store(e) => e.code(),
            Error::NotFound => "NOT_FOUND",
            Error::DuplicateId => "DUPLICATE_ID",
            Error::IdSpaceExhausted(_) => "ID_SPACE_EXHAUSTED",
            Error::InvalidUrl { .. } => "INVALID_URL",
            Error::SubmittedAlreadyExpired => "SUBMITTED_ALREADY_EXPIRED",
            Error::IdConstraintViolation { .. } => "ID_CONSTRAINT_VIOLATION",
            Error::InvalidRecord { .. } => "INVALID_RECORD",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            Error::SessionClosed => "SESSION_CLOSED",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Store(distill_core::Error::Io(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A read-time lifecycle outcome that is not a system failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    #[error("url inactive")]
    Inactive,

    #[error("url expired")]
    Expired,

    #[error("url exhausted")]
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_messages() {
        assert_eq!(Verdict::Inactive.to_string(), "url inactive");
        assert_eq!(Verdict::Expired.to_string(), "url expired");
        assert_eq!(Verdict::Exhausted.to_string(), "url exhausted");
    }

    #[test]
    fn test_store_errors_keep_their_code() {
        let err: Error = distill_core::Error::ChecksumMismatch.into();
        assert_eq!(err.code(), "CHECKSUM_MISMATCH");
        assert_eq!(Error::NotFound.code(), "NOT_FOUND");
        assert!(Error::NotFound.is_not_found());
    }
}
