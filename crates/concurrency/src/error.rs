//! Errors raised by the concurrency controller.
//!
//! Version mismatches are not errors: they come back as
//! [`Admission::Conflict`](crate::Admission::Conflict) or
//! [`CommitOutcome::Conflict`](crate::CommitOutcome::Conflict). What remains
//! here is caller misuse (no precondition, unknown or duplicate id) and
//! infrastructure faults.

use std::sync::Arc;

use corpdir_storage::{BoxError, StorageError};
use thiserror::Error;

/// Result alias for controller operations.
pub type Result<T> = std::result::Result<T, ConcurrencyError>;

/// Errors from [`ConcurrencyController`](crate::ConcurrencyController).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ConcurrencyError {
    /// No resource with this id.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Resource id.
        id: String,
    },

    /// `create` found the id already taken.
    #[error("Resource already exists: {id}")]
    AlreadyExists {
        /// Resource id.
        id: String,
    },

    /// A mutation arrived without an expected version.
    #[error("Mutation requires an expected version")]
    PreconditionRequired,

    /// Resource state could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// What failed.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ConcurrencyError {
    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates an `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists { id: id.into() }
    }

    /// Creates a `Serialization` error from a `serde_json` failure.
    #[must_use]
    pub fn serialization(message: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Stable code for logs and HTTP error bodies.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::PreconditionRequired => "precondition_required",
            Self::Serialization { .. } => "serialization",
            Self::Storage(_) => "storage",
        }
    }
}
