//! Optimistic concurrency control for directory resources.
//!
//! Every resource carries a [`VersionToken`] derived from its stored state.
//! A mutation names the version it read; [`ConcurrencyController`] admits it
//! only if that version is still current and commits it as one conditional
//! write on the [`StorageBackend`](corpdir_storage::StorageBackend). No
//! request waits for another: of two conflicting writers, one wins and the
//! other is told to re-read.
//!
//! ```no_run
//! use corpdir_concurrency::{ConcurrencyController, UpdateOutcome, VersionToken};
//! use corpdir_storage::MemoryBackend;
//! use serde_json::{Value, json};
//!
//! # async fn example() -> corpdir_concurrency::Result<()> {
//! let contacts = ConcurrencyController::new(MemoryBackend::new(), "contacts");
//! let v1 = contacts.create("c-1", &json!({"name": "Ada"})).await?;
//!
//! let if_match = VersionToken::from_if_match(&v1.to_etag());
//! match contacts.update("c-1", if_match.as_ref(), |_: Value| json!({"name": "Ada L."})).await? {
//!     UpdateOutcome::Updated(current) => println!("now at {}", current.version),
//!     UpdateOutcome::Conflict => println!("changed underneath us; re-read"),
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod controller;
pub mod error;
pub mod version;

pub use controller::{Admission, CommitOutcome, ConcurrencyController, Prepared, UpdateOutcome, Versioned};
pub use error::{ConcurrencyError, Result};
pub use version::VersionToken;
