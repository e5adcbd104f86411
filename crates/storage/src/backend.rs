//! Storage backend trait definition.
//!
//! The trait provides a small key-value interface:
//! - **Keys and values are bytes**: no assumptions about serialization format
//! - **Async by default**: implementations may perform network I/O
//! - **Conditional writes**: [`compare_and_set`](StorageBackend::compare_and_set) and
//!   [`compare_and_delete`](StorageBackend::compare_and_delete) are single atomic steps
//!
//! Domain logic (replay records, versioned resources) lives in the crates
//! built on top of this trait, not in the backends.

use std::ops::RangeBounds;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::StorageResult,
    health::{HealthProbe, HealthStatus},
    types::KeyValue,
};

/// Abstract storage backend for key-value operations.
///
/// Backends are `Send + Sync` and must tolerate concurrent callers.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`set`](StorageBackend::set) | Store a key-value pair unconditionally |
/// | [`compare_and_set`](StorageBackend::compare_and_set) | Atomic insert-if-absent / update-if-unchanged |
/// | [`compare_and_delete`](StorageBackend::compare_and_delete) | Atomic delete-if-unchanged |
/// | [`delete`](StorageBackend::delete) | Remove a key |
/// | [`get_range`](StorageBackend::get_range) | Retrieve keys in a range, ordered |
/// | [`health_check`](StorageBackend::health_check) | Probe backend availability |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use corpdir_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// Returns `Ok(None)` when the key does not exist.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair, overwriting any existing value.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Atomically sets a key's value if it matches the expected current value.
    ///
    /// # Semantics
    ///
    /// - **`expected: None`**: insert-if-absent. Succeeds only when the key does not exist.
    /// - **`expected: Some(value)`**: update-if-unchanged. Succeeds only when the current value
    ///   is a byte-for-byte match of `value`.
    ///
    /// The comparison is exact and length-sensitive. Callers that serialize
    /// structured data must produce deterministic bytes (struct fields or
    /// `BTreeMap`s, never `HashMap`s).
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict) when the precondition does
    ///   not hold. The stored value is left untouched.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use corpdir_storage::{MemoryBackend, StorageBackend};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let backend = MemoryBackend::new();
    /// backend.set(b"version".to_vec(), b"1".to_vec()).await?;
    ///
    /// // Succeeds: current value is "1"
    /// backend.compare_and_set(b"version", Some(b"1".as_slice()), b"2".to_vec()).await?;
    ///
    /// // Fails: current value is now "2"
    /// let result = backend.compare_and_set(b"version", Some(b"1".as_slice()), b"3".to_vec()).await;
    /// assert!(result.is_err());
    /// # Ok(())
    /// # }
    /// ```
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Atomically deletes a key if its current value matches `expected`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict) when the key is absent or
    ///   holds different bytes.
    #[must_use = "compare-and-delete may fail with a conflict and errors must be handled"]
    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()>;

    /// Deletes a key. Deleting a missing key is a no-op.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Retrieves all key-value pairs within a range, in key order.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Checks backend health for the given probe type.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus>;
}
