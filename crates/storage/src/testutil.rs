//! Shared test utilities for storage backend testing.
//!
//! Feature-gated behind `testutil` so the helpers never leak into production
//! builds. Enable the feature in a dependent crate's `[dev-dependencies]`:
//!
//! ```toml
//! [dev-dependencies]
//! corpdir-storage = { workspace = true, features = ["testutil"] }
//! ```

use crate::{
    StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"`. Zero-padding keeps lexicographic
/// order equal to numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Create a value tagged with a task ID, e.g. `"task3-val42"`.
///
/// Concurrent tests use it to identify which task wrote a value.
#[must_use]
pub fn make_tagged_value(task: usize, seq: usize) -> Vec<u8> {
    format!("task{task}-val{seq}").into_bytes()
}

/// Create a [`MemoryBackend`] pre-populated with `count` keys under `prefix`.
///
/// # Panics
///
/// Panics if any `set` fails (never happens with `MemoryBackend`).
pub async fn populated_backend(prefix: &str, count: usize) -> MemoryBackend {
    let backend = MemoryBackend::new();
    for i in 0..count {
        backend.set(make_key(prefix, i), make_tagged_value(0, i)).await.expect("populate set");
    }
    backend
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`].
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Returns `true` if the result is a conflict.
pub fn is_conflict<T>(result: &StorageResult<T>) -> bool {
    matches!(result, Err(StorageError::Conflict))
}
