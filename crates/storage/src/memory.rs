//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] keeps all data in a [`BTreeMap`] behind a
//! [`parking_lot::RwLock`]. Conditional writes hold the write lock for the
//! whole read-compare-write step, which is what makes them atomic.
//!
//! # Example
//!
//! ```
//! use corpdir_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; everything is lost when the process exits
//! - No replication

use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::RwLock;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    health::{HealthMetadata, HealthProbe, HealthStatus},
    types::KeyValue,
};

/// In-memory storage backend using [`BTreeMap`].
///
/// `MemoryBackend` is cheaply cloneable. All clones share the same store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
}

impl MemoryBackend {
    /// Creates an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` when no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        fail_point!("memory-before-set", |_| {
            Err(StorageError::internal("injected failure before set"))
        });
        self.data.write().insert(key, Bytes::from(value));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        fail_point!("memory-before-cas", |_| {
            Err(StorageError::internal("injected failure before compare-and-set"))
        });

        let mut data = self.data.write();

        let matches = match (expected, data.get(key)) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };

        if !matches {
            tracing::debug!(key = %String::from_utf8_lossy(key), "compare-and-set conflict");
            return Err(StorageError::conflict());
        }

        data.insert(key.to_vec(), Bytes::from(new_value));
        Ok(())
    }

    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();

        match data.get(key) {
            Some(current) if current[..] == *expected => {
                data.remove(key);
                Ok(())
            },
            _ => Err(StorageError::conflict()),
        }
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let start = match range.start_bound() {
            Bound::Included(b) => Bound::Included(b.as_slice()),
            Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };
        let end = match range.end_bound() {
            Bound::Included(b) => Bound::Included(b.as_slice()),
            Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };

        // BTreeMap::range panics on inverted bounds; an inverted range is simply empty.
        if let (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) =
            (start, end)
            && (s > e || (s == e && matches!((start, end), (Bound::Excluded(_), Bound::Excluded(_)))))
        {
            return Ok(Vec::new());
        }

        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((start, end))
            .map(|(k, v)| KeyValue::new(Bytes::copy_from_slice(k), v.clone()))
            .collect())
    }

    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus> {
        let started = Instant::now();
        // Acquiring the read lock proves the store is not wedged.
        let entries = self.data.read().len();
        let metadata = HealthMetadata::new(started.elapsed(), "memory")
            .with_detail("probe", probe.to_string())
            .with_detail("entry_count", entries.to_string());
        Ok(HealthStatus::healthy(metadata))
    }
}
