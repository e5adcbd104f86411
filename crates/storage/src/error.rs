//! Storage error types and result alias.
//!
//! All storage backends map their internal failures to [`StorageError`].
//! Callers in the admission layer only ever branch on two variants:
//! [`StorageError::Conflict`] (a conditional write lost) and everything else
//! (an infrastructure fault that propagates to the transport layer).
//!
//! # Example
//!
//! ```
//! use corpdir_storage::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(key))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A shared error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested key was not found.
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A conditional write observed a value other than the expected one.
    ///
    /// Returned by [`compare_and_set`](crate::StorageBackend::compare_and_set)
    /// and [`compare_and_delete`](crate::StorageBackend::compare_and_delete).
    /// Never transient: retrying the same precondition cannot succeed.
    #[error("Conditional write conflict")]
    Conflict,

    /// Connection or network error.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Stored bytes could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Backend-specific internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation exceeded its time limit.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` for faults that may succeed if the caller retries later.
    ///
    /// `Conflict` and `NotFound` describe the data, not the backend, and are
    /// never transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(StorageError::not_found("contact:1").to_string(), "Key not found: contact:1");
        assert_eq!(StorageError::conflict().to_string(), "Conditional write conflict");
        assert_eq!(StorageError::timeout().to_string(), "Operation timeout");
        assert_eq!(
            StorageError::connection("refused").to_string(),
            "Connection error: refused"
        );
    }

    #[test]
    fn test_serialization_preserves_source() {
        let json_err = serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err();
        let err = StorageError::serialization_with_source("bad record", json_err);

        let source = err.source().expect("source chain must be preserved");
        assert!(source.to_string().contains("EOF"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::timeout().is_transient());
        assert!(StorageError::connection("reset").is_transient());
        assert!(!StorageError::conflict().is_transient());
        assert!(!StorageError::not_found("k").is_transient());
        assert!(!StorageError::internal("boom").is_transient());
    }
}
