//! Duplicate-delivery detection for webhooks.
//!
//! A guard answers one question atomically: "is `(source, nonce)` new?" The
//! check and the insert are a single operation in both implementations, so
//! two identical deliveries racing each other can never both be told they
//! are fresh.
//!
//! # Retention
//!
//! An entry only matters while a delivery carrying the same declared
//! timestamp could still pass the freshness check. Each entry is therefore
//! retained until `declared_ts + retention`, computed from the entry's own
//! timestamp, never from access order or cache pressure.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use chrono::Utc;
//! use corpdir_authn::replay::{InMemoryReplayGuard, ReplayGuard, ReplayStatus};
//!
//! # async fn example() -> Result<(), corpdir_storage::StorageError> {
//! let guard = InMemoryReplayGuard::new(Duration::from_secs(330));
//! let now = Utc::now();
//! let status = guard.check_and_mark("crm-x", "n1", now.timestamp(), now).await?;
//! assert_eq!(status, ReplayStatus::Fresh);
//! # Ok(())
//! # }
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corpdir_storage::{StorageBackend, StorageError, StorageResult, types::prefix_end};
use moka::future::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Outcome of [`ReplayGuard::check_and_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    /// First time this pair was seen. It is now recorded.
    Fresh,
    /// The pair was already recorded and is still retained.
    Duplicate,
}

/// Atomic insert-if-absent over `(source, nonce)` pairs.
#[async_trait]
pub trait ReplayGuard: Send + Sync {
    /// Record `(source, nonce)` and report whether it was new.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the backing store fails. The in-memory
    /// guard never fails.
    async fn check_and_mark(
        &self,
        source: &str,
        nonce: &str,
        declared_ts: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<ReplayStatus>;

    /// Forget `(source, nonce)` so a redelivery is accepted again.
    ///
    /// Used when an accepted delivery could not be handed off, so the
    /// sender's retry is not reported as a duplicate.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the backing store fails.
    async fn release(&self, source: &str, nonce: &str) -> StorageResult<()>;
}

fn retention_secs(retention: Duration) -> i64 {
    i64::try_from(retention.as_secs()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
struct ReplayEntry {
    first_seen: DateTime<Utc>,
    ttl: Duration,
}

/// Per-entry expiry from the TTL computed at insertion.
struct ReplayExpiry;

impl moka::Expiry<(String, String), ReplayEntry> for ReplayExpiry {
    fn expire_after_create(
        &self,
        _key: &(String, String),
        value: &ReplayEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process guard backed by a [`moka::future::Cache`].
///
/// There is no capacity bound: evicting a live entry under memory pressure
/// would let a replay through. Memory is bounded by delivery rate times
/// retention instead.
pub struct InMemoryReplayGuard {
    seen: Cache<(String, String), ReplayEntry>,
    retention: Duration,
}

impl InMemoryReplayGuard {
    /// Creates a guard that retains each pair until `declared_ts + retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        let seen = Cache::builder().expire_after(ReplayExpiry).build();
        Self { seen, retention }
    }

    /// Retention added to each declared timestamp.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Approximate number of retained pairs.
    ///
    /// Eventually consistent; call [`sync`](Self::sync) first for an exact count.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.seen.entry_count()
    }

    /// Run pending expirations.
    pub async fn sync(&self) {
        self.seen.run_pending_tasks().await;
    }
}

#[async_trait]
impl ReplayGuard for InMemoryReplayGuard {
    async fn check_and_mark(
        &self,
        source: &str,
        nonce: &str,
        declared_ts: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<ReplayStatus> {
        let expires_at = declared_ts.saturating_add(retention_secs(self.retention));
        // A fresh delivery is at most one window in the future, so twice the
        // retention bounds any legitimate TTL.
        let ttl = Duration::from_secs(
            u64::try_from(expires_at.saturating_sub(now.timestamp())).unwrap_or(0),
        )
        .min(self.retention.saturating_mul(2));

        let entry = self
            .seen
            .entry((source.to_owned(), nonce.to_owned()))
            .or_insert(ReplayEntry { first_seen: now, ttl })
            .await;

        if entry.is_fresh() {
            Ok(ReplayStatus::Fresh)
        } else {
            tracing::debug!(
                source,
                nonce,
                first_seen = %entry.value().first_seen,
                "duplicate delivery"
            );
            Ok(ReplayStatus::Duplicate)
        }
    }

    async fn release(&self, source: &str, nonce: &str) -> StorageResult<()> {
        self.seen.invalidate(&(source.to_owned(), nonce.to_owned())).await;
        Ok(())
    }
}

/// Key prefix for durable replay records.
pub const REPLAY_KEY_PREFIX: &[u8] = b"replay/";

/// Durable replay record as stored in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    /// Timestamp the sender declared.
    pub declared_ts: i64,
    /// When the delivery was first accepted (seconds since epoch).
    pub first_seen: i64,
    /// Retained while `now < expires_at`.
    pub expires_at: i64,
}

impl ReplayRecord {
    fn encode(&self) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| StorageError::serialization_with_source("encode replay record", e))
    }

    fn decode(bytes: &[u8]) -> StorageResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StorageError::serialization_with_source("decode replay record", e))
    }

    fn lapsed(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now.timestamp()
    }
}

/// Storage key for a pair. Both parts are hex-encoded so separators inside
/// a source or nonce cannot collide.
#[must_use]
pub fn replay_key(source: &str, nonce: &str) -> Vec<u8> {
    format!("replay/{}/{}", hex::encode(source), hex::encode(nonce)).into_bytes()
}

/// Guard persisted in a [`StorageBackend`], shared by every process that
/// uses the same store.
///
/// Records are written with `compare_and_set(key, None, ..)`. A record whose
/// retention has lapsed is superseded with a compare-and-set against its
/// exact bytes, so the takeover is atomic too.
pub struct StorageReplayGuard<B> {
    backend: B,
    retention: Duration,
    cancel_token: CancellationToken,
    purge_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<B: StorageBackend + 'static> StorageReplayGuard<B> {
    /// Creates a guard over `backend`.
    #[must_use]
    pub fn new(backend: B, retention: Duration) -> Self {
        Self {
            backend,
            retention,
            cancel_token: CancellationToken::new(),
            purge_handle: Mutex::new(None),
        }
    }

    /// The underlying backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Delete records whose retention lapsed at or before `now`.
    ///
    /// Returns the number of records removed. A record superseded between
    /// the scan and the delete is left alone.
    ///
    /// # Errors
    ///
    /// Propagates backend failures other than compare-and-delete conflicts.
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let start = REPLAY_KEY_PREFIX.to_vec();
        let entries = match prefix_end(REPLAY_KEY_PREFIX) {
            Some(end) => self.backend.get_range(start..end).await?,
            None => self.backend.get_range(start..).await?,
        };

        let mut purged = 0;
        for entry in entries {
            let record = match ReplayRecord::decode(&entry.value) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping undecodable replay record");
                    continue;
                },
            };
            if !record.lapsed(now) {
                continue;
            }
            match self.backend.compare_and_delete(&entry.key, &entry.value).await {
                Ok(()) => purged += 1,
                Err(StorageError::Conflict) => {},
                Err(err) => return Err(err),
            }
        }

        if purged > 0 {
            tracing::info!(purged, "purged lapsed replay records");
        }
        Ok(purged)
    }

    /// Spawn a task that purges every `interval` until [`shutdown`](Self::shutdown).
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn start_purge_task(self: Arc<Self>, interval: Duration) -> Arc<Self> {
        let guard = Arc::clone(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; nothing to purge at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("replay purge task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = guard.purge(Utc::now()).await {
                            tracing::warn!(error = %err, "replay purge failed");
                        }
                    }
                }
            }
        });

        *self.purge_handle.lock() = Some(handle);
        self
    }

    /// Stop the purge task, if running, and wait for it.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.purge_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "replay purge task panicked");
        }
    }
}

#[async_trait]
impl<B: StorageBackend + 'static> ReplayGuard for StorageReplayGuard<B> {
    async fn check_and_mark(
        &self,
        source: &str,
        nonce: &str,
        declared_ts: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<ReplayStatus> {
        let key = replay_key(source, nonce);
        let record = ReplayRecord {
            declared_ts,
            first_seen: now.timestamp(),
            expires_at: declared_ts.saturating_add(retention_secs(self.retention)),
        };
        let bytes = record.encode()?;

        match self.backend.compare_and_set(&key, None, bytes.clone()).await {
            Ok(()) => return Ok(ReplayStatus::Fresh),
            Err(StorageError::Conflict) => {},
            Err(err) => return Err(err),
        }

        let Some(existing) = self.backend.get(&key).await? else {
            // Purged between our insert attempt and the read.
            return match self.backend.compare_and_set(&key, None, bytes).await {
                Ok(()) => Ok(ReplayStatus::Fresh),
                Err(StorageError::Conflict) => Ok(ReplayStatus::Duplicate),
                Err(err) => Err(err),
            };
        };

        let previous = ReplayRecord::decode(&existing)?;
        if !previous.lapsed(now) {
            tracing::debug!(source, nonce, first_seen = previous.first_seen, "duplicate delivery");
            return Ok(ReplayStatus::Duplicate);
        }

        match self.backend.compare_and_set(&key, Some(existing.as_ref()), bytes).await {
            Ok(()) => Ok(ReplayStatus::Fresh),
            Err(StorageError::Conflict) => Ok(ReplayStatus::Duplicate),
            Err(err) => Err(err),
        }
    }

    async fn release(&self, source: &str, nonce: &str) -> StorageResult<()> {
        self.backend.delete(&replay_key(source, nonce)).await
    }
}
