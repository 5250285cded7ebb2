//! Error types for the engram library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`EngramError`] enum. Backend transport failures are wrapped, never
//! retried here; retry policy belongs to the caller.
//!
//! # Examples
//!
//! ```
//! use engram::error::{EngramError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(EngramError::not_found("file missing"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use anyhow;
use thiserror::Error;

/// The main error type for engram operations.
///
/// Logical inconsistencies ([`EngramError::AmbiguousIndex`]) are fatal and
/// must not be masked. Not-found on read is a recoverable, expected
/// condition. Backend errors carry whatever the transport reported.
#[derive(Error, Debug)]
pub enum EngramError {
    /// Requested content or document is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// More than one search-index definition matches one expected name.
    ///
    /// The design assumes a strict 1:1 mapping from collection to search
    /// index; duplicates are corruption, not a condition to resolve.
    #[error("Ambiguous index state: {0}")]
    AmbiguousIndex(String),

    /// An operation required a ready index, but the build has not finished.
    #[error("Index not ready: {0}")]
    IndexNotReady(String),

    /// Operation not supported by this store or backend.
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Backend transport or command failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with EngramError.
pub type Result<T> = std::result::Result<T, EngramError>;

impl EngramError {
    /// Create a new not-found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        EngramError::NotFound(msg.into())
    }

    /// Create a new ambiguous-index error.
    pub fn ambiguous_index<S: Into<String>>(msg: S) -> Self {
        EngramError::AmbiguousIndex(msg.into())
    }

    /// Create a new index-not-ready error.
    pub fn index_not_ready<S: Into<String>>(msg: S) -> Self {
        EngramError::IndexNotReady(msg.into())
    }

    /// Create a new unsupported-operation error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        EngramError::Unsupported(msg.into())
    }

    /// Create a new backend error.
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        EngramError::Backend(msg.into())
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        EngramError::Cancelled(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        EngramError::Other(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        EngramError::Other(format!("Invalid argument: {}", msg.into()))
    }

    /// True for conditions a caller may treat as expected and recover from.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngramError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = EngramError::not_found("missing file");
        assert_eq!(error.to_string(), "Not found: missing file");

        let error = EngramError::backend("connection reset");
        assert_eq!(error.to_string(), "Backend error: connection reset");

        let error = EngramError::ambiguous_index("two definitions for _ix_a");
        assert_eq!(
            error.to_string(),
            "Ambiguous index state: two definitions for _ix_a"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let engram_error = EngramError::from(json_error);

        match engram_error {
            EngramError::Json(_) => {}
            _ => panic!("Expected JSON error variant"),
        }
    }

    #[test]
    fn test_is_not_found() {
        assert!(EngramError::not_found("x").is_not_found());
        assert!(!EngramError::backend("x").is_not_found());
    }
}
