//! Storage backend abstraction for the corpdir services.
//!
//! This crate provides the [`StorageBackend`] trait that the admission layer
//! relies on for its one hard atomicity requirement: a conditional write.
//! Replay records and versioned resources are both persisted through
//! [`StorageBackend::compare_and_set`], so the atomicity of "insert if absent"
//! and "update if unchanged" lives here rather than in application locks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HTTP surface (corpdir-api)               │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  ConcurrencyController       │  StorageReplayGuard          │
//! │  (corpdir-concurrency)       │  (corpdir-authn)             │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                 corpdir-storage                             │
//! │              StorageBackend trait                           │
//! │   (get, set, compare_and_set, compare_and_delete, ...)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 MemoryBackend                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use corpdir_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     // Insert-if-absent succeeds once.
//!     backend.compare_and_set(b"contact:1", None, b"{}".to_vec()).await?;
//!     assert!(backend.compare_and_set(b"contact:1", None, b"{}".to_vec()).await.is_err());
//!
//!     let value = backend.get(b"contact:1").await?;
//!     assert_eq!(value.map(|b| b.to_vec()), Some(b"{}".to_vec()));
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test helpers and assertion macros.
//! - **`failpoints`**: Activates the `fail` crate's injection points inside [`MemoryBackend`].

#![deny(unsafe_code)]

pub mod backend;
pub mod error;
pub mod health;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod types;

pub use backend::StorageBackend;
pub use error::{BoxError, StorageError, StorageResult};
pub use health::{HealthMetadata, HealthProbe, HealthStatus};
pub use memory::MemoryBackend;
pub use types::KeyValue;
