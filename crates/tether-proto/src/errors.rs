//! Protocol decoding errors.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while decoding a command line.
///
/// None of these are fatal to a channel. The receiver logs the error and
/// drops the offending line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Line is not valid JSON
    #[error("malformed command line: {0}")]
    Json(String),

    /// Line is valid JSON but not an array
    #[error("command must be a JSON array")]
    NotAnArray,

    /// Array is empty or its first element is not a string
    #[error("command is missing its verb")]
    MissingVerb,

    /// Wrong number of arguments for a known verb
    #[error("{verb} expects {expected} arguments, got {got}")]
    Arity {
        /// Verb being decoded
        verb: &'static str,
        /// Human-readable expected count (e.g. "2" or "1-2")
        expected: &'static str,
        /// Number of arguments actually present
        got: usize,
    },

    /// An argument had the wrong JSON type
    #[error("{verb} argument {index} must be {expected}")]
    InvalidArgument {
        /// Verb being decoded
        verb: &'static str,
        /// Zero-based argument position (verb excluded)
        index: usize,
        /// Expected JSON type
        expected: &'static str,
    },

    /// Line exceeds [`crate::MAX_LINE_LEN`]
    #[error("command line too long: {size} bytes (max {max})")]
    LineTooLong {
        /// Actual size in bytes
        size: usize,
        /// Maximum allowed size
        max: usize,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
