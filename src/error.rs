//! Error types for the embertable write buffer.

use std::fmt;

/// The result type used throughout embertable.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for MemTable operations.
///
/// The MemTable itself is infallible on the write path (allocation failure
/// is a process-level fatal condition, and invariant violations abort), so
/// this type surfaces only the conditions a caller can act on.
#[derive(Debug)]
pub enum Error {
    /// The requested key was not found, or its visible version is a
    /// deletion tombstone.
    NotFound(String),

    /// An invalid argument was provided (configuration validation).
    InvalidArgument(String),

    /// Data corruption was detected while decoding an entry.
    ///
    /// Entries are produced and consumed by the same process, so the core
    /// never emits this; it exists for API parity with the surrounding
    /// engine's status taxonomy.
    Corruption(String),
}

impl Error {
    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Returns `true` if this error is a `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Corruption(msg) => write!(f, "Data corruption: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("k1");
        assert_eq!(err.to_string(), "Not found: k1");
        assert!(err.is_not_found());

        let err = Error::invalid_argument("hot_threshold_bytes");
        assert_eq!(err.to_string(), "Invalid argument: hot_threshold_bytes");
        assert!(!err.is_not_found());
    }
}
