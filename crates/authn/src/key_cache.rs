//! Cached, self-healing view of the identity provider's signing keys.
//!
//! # Architecture
//!
//! ```text
//! validator ──get_keys(now)──► snapshot fresh? ──yes──► Arc<KeySet>
//!                                   │ no
//!                                   ▼
//!                       refresh (single-flight, bounded by fetch_timeout)
//!                           │ ok                       │ err
//!                           ▼                          ▼
//!                  swap snapshot, return    old snapshot within max_staleness?
//!                                              yes → serve it (warn)
//!                                              no  → KeysUnavailable
//! ```
//!
//! After a failed refresh, requests within `min_refresh_interval` of the
//! failure do not fetch again: they get the last good set if it is within
//! `max_staleness`, and `KeysUnavailable` otherwise. The background task is
//! not subject to this backoff.
//!
//! Readers clone an `Arc` out of a short read lock and never wait on a fetch
//! in progress. The fetch itself runs with no in-memory lock held except the
//! async single-flight mutex; the snapshot write lock is taken only to swap
//! the finished set in.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use corpdir_storage::{HealthMetadata, HealthStatus};
use fail::fail_point;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{KeyCacheConfig, RotationPolicy},
    error::{AuthError, ConfigError},
    jwks::{JwkSet, KeySet},
    key_source::KeySource,
};

/// Point-in-time view of the cache for readiness probes and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCacheStatus {
    /// Whether a key set has ever been installed.
    pub loaded: bool,
    /// Number of keys in the current set.
    pub key_count: usize,
    /// When the current set was fetched.
    pub fetched_at: Option<DateTime<Utc>>,
    /// Message of the most recent failed refresh, cleared on success.
    pub last_error: Option<String>,
    /// Successful refreshes since construction.
    pub refresh_count: u64,
    /// Failed refreshes since construction.
    pub refresh_errors: u64,
}

/// Cache of verification keys fetched from a [`KeySource`].
///
/// # Refresh triggers
///
/// - A background task started with
///   [`start_background_refresh`](Self::start_background_refresh).
/// - [`get_keys`](Self::get_keys) when the snapshot is missing or older than
///   the freshness window.
/// - [`refresh_for_unknown_kid`](Self::refresh_for_unknown_kid), rate-limited
///   by `min_refresh_interval`.
///
/// Concurrent refreshes collapse into one fetch; callers that queued behind
/// it receive its outcome.
pub struct KeyCache {
    source: Arc<dyn KeySource>,
    config: KeyCacheConfig,
    snapshot: RwLock<Option<Arc<KeySet>>>,
    /// Single-flight guard for fetches.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Completed fetch attempts, successful or not.
    attempts: AtomicU64,
    last_error: RwLock<Option<String>>,
    /// Logical time of the most recent failed refresh, cleared on success.
    last_failure: RwLock<Option<DateTime<Utc>>>,
    last_forced_refresh: Mutex<Option<Instant>>,
    cancel_token: CancellationToken,
    refresh_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    refresh_count: AtomicU64,
    refresh_errors: AtomicU64,
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn age_within(now: DateTime<Utc>, fetched_at: DateTime<Utc>, limit: Duration) -> bool {
    // A negative age (clock stepped back) counts as fresh.
    now.signed_duration_since(fetched_at).to_std().map_or(true, |age| age <= limit)
}

impl KeyCache {
    /// Creates an empty cache. Nothing is fetched until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(source: Arc<dyn KeySource>, config: KeyCacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            source,
            config,
            snapshot: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_error: RwLock::new(None),
            last_failure: RwLock::new(None),
            last_forced_refresh: Mutex::new(None),
            cancel_token: CancellationToken::new(),
            refresh_handle: Mutex::new(None),
            refresh_count: AtomicU64::new(0),
            refresh_errors: AtomicU64::new(0),
        })
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &KeyCacheConfig {
        &self.config
    }

    /// The current key set, without any freshness check.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<KeySet>> {
        self.snapshot.read().clone()
    }

    /// Return a key set usable at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeysUnavailable`] if no set was ever fetched, or
    /// the refresh failed and the last good set is older than
    /// `max_staleness`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_keys(&self, now: DateTime<Utc>) -> Result<Arc<KeySet>, AuthError> {
        if let Some(set) = self.snapshot()
            && age_within(now, set.fetched_at(), self.config.freshness_window)
        {
            return Ok(set);
        }

        if self.backing_off(now) {
            if let Some(set) = self.servable(now) {
                tracing::debug!(
                    fetched_at = %set.fetched_at(),
                    "recent key refresh failed, serving last good key set without fetching"
                );
                return Ok(set);
            }
            let message =
                self.last_error.read().clone().unwrap_or_else(|| "key refresh failed".to_owned());
            return Err(AuthError::keys_unavailable(message));
        }

        match self.refresh_at(now).await {
            Ok(set) => Ok(set),
            Err(err) => {
                if let Some(set) = self.servable(now) {
                    tracing::warn!(
                        error = %err,
                        fetched_at = %set.fetched_at(),
                        "key refresh failed, serving last good key set"
                    );
                    return Ok(set);
                }
                tracing::error!(error = %err, "no usable signing key set");
                Err(AuthError::keys_unavailable(err.to_string()))
            },
        }
    }

    fn servable(&self, now: DateTime<Utc>) -> Option<Arc<KeySet>> {
        self.snapshot().filter(|set| age_within(now, set.fetched_at(), self.config.max_staleness))
    }

    fn backing_off(&self, now: DateTime<Utc>) -> bool {
        self.last_failure.read().is_some_and(|at| {
            now.signed_duration_since(at)
                .to_std()
                .is_ok_and(|since| since < self.config.min_refresh_interval)
        })
    }

    /// Fetch the key set now.
    ///
    /// On failure the previous set stays installed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySource`] if the fetch fails, times out, or
    /// yields no usable keys.
    pub async fn refresh(&self) -> Result<Arc<KeySet>, AuthError> {
        self.refresh_at(Utc::now()).await
    }

    /// Force one refresh because a token named a `kid` we do not have.
    ///
    /// Returns `Ok(None)` without fetching when the previous forced refresh
    /// happened less than `min_refresh_interval` ago, so random `kid`s cannot
    /// turn the cache into a request amplifier against the key source.
    ///
    /// # Errors
    ///
    /// Propagates the refresh failure.
    pub async fn refresh_for_unknown_kid(
        &self,
        kid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<KeySet>>, AuthError> {
        {
            let mut last = self.last_forced_refresh.lock();
            if let Some(at) = *last
                && at.elapsed() < self.config.min_refresh_interval
            {
                tracing::debug!(kid, "unknown kid refresh suppressed by rate limit");
                return Ok(None);
            }
            *last = Some(Instant::now());
        }

        tracing::info!(kid, "unknown kid, forcing key refresh");
        self.refresh_at(now).await.map(Some)
    }

    async fn refresh_at(&self, now: DateTime<Utc>) -> Result<Arc<KeySet>, AuthError> {
        let observed = self.attempts.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        if self.attempts.load(Ordering::Acquire) != observed {
            // A fetch completed while we waited; share its outcome.
            let last_error = self.last_error.read().clone();
            return match (last_error, self.snapshot()) {
                (None, Some(set)) => Ok(set),
                (Some(message), _) => Err(AuthError::key_source(message)),
                (None, None) => Err(AuthError::key_source("no key set installed")),
            };
        }

        let result = self.fetch_and_install(now).await;
        match &result {
            Ok(_) => {
                *self.last_error.write() = None;
                *self.last_failure.write() = None;
                self.refresh_count.fetch_add(1, Ordering::Relaxed);
            },
            Err(err) => {
                *self.last_error.write() = Some(err.to_string());
                *self.last_failure.write() = Some(now);
                self.refresh_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, reason = err.reason(), "key set refresh failed");
            },
        }
        self.attempts.fetch_add(1, Ordering::Release);
        result
    }

    async fn fetch_and_install(&self, now: DateTime<Utc>) -> Result<Arc<KeySet>, AuthError> {
        let jwks = self.fetch_bounded().await?;
        let mut set = KeySet::from_jwks(&jwks, now)?;

        if let RotationPolicy::RetainRetired { grace } = self.config.rotation
            && let Some(previous) = self.snapshot()
        {
            set = set.retain_retired(&previous, now, grace);
        }

        let set = Arc::new(set);
        let previous = self.snapshot.write().replace(Arc::clone(&set));

        let changed = previous.as_ref().is_none_or(|p| p.kids() != set.kids());
        if changed {
            tracing::info!(
                audit.action = "signing_keys_rotated",
                kids = ?set.kids(),
                "installed signing key set"
            );
        } else {
            tracing::debug!(keys = set.len(), "refreshed signing key set");
        }
        Ok(set)
    }

    async fn fetch_bounded(&self) -> Result<JwkSet, AuthError> {
        fail_point!("key-cache-before-fetch", |_| {
            Err(AuthError::key_source("injected fetch failure"))
        });

        match tokio::time::timeout(self.config.fetch_timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::key_source(format!(
                "key set fetch timed out after {:?}",
                self.config.fetch_timeout
            ))),
        }
    }

    /// Spawn a task that fetches immediately and then every `interval`
    /// until [`shutdown`](Self::shutdown).
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn start_background_refresh(self: Arc<Self>, interval: Duration) -> Arc<Self> {
        let cache = Arc::clone(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("key refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Failures are logged and counted inside refresh().
                        let _ = cache.refresh().await;
                    }
                }
            }
        });

        *self.refresh_handle.lock() = Some(handle);
        self
    }

    /// Stop the background refresh task, if running, and wait for it.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.refresh_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "key refresh task panicked");
        }
    }

    /// Cancellation token for the background task.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Whether a key set usable at `now` is installed.
    #[must_use]
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.snapshot()
            .is_some_and(|set| age_within(now, set.fetched_at(), self.config.max_staleness))
    }

    /// [`is_ready_at`](Self::is_ready_at) with the current time.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Utc::now())
    }

    /// Current status counters.
    #[must_use]
    pub fn status(&self) -> KeyCacheStatus {
        let snapshot = self.snapshot();
        KeyCacheStatus {
            loaded: snapshot.is_some(),
            key_count: snapshot.as_ref().map_or(0, |s| s.len()),
            fetched_at: snapshot.as_ref().map(|s| s.fetched_at()),
            last_error: self.last_error.read().clone(),
            refresh_count: self.refresh_count.load(Ordering::Relaxed),
            refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
        }
    }

    /// Readiness as a [`HealthStatus`]: unhealthy without a usable set,
    /// degraded while serving a set older than the freshness window.
    #[must_use]
    pub fn health(&self, now: DateTime<Utc>) -> HealthStatus {
        let start = Instant::now();
        let status = self.status();
        let mut metadata = HealthMetadata::new(start.elapsed(), "key_cache")
            .with_detail("key_count", status.key_count.to_string());
        if let Some(at) = status.fetched_at {
            metadata = metadata.with_detail("fetched_at", at.to_rfc3339());
        }

        match self.snapshot() {
            None => HealthStatus::unhealthy(metadata, "no key set fetched"),
            Some(set) if !age_within(now, set.fetched_at(), self.config.max_staleness) => {
                HealthStatus::unhealthy(metadata, "key set older than staleness ceiling")
            },
            Some(set) if !age_within(now, set.fetched_at(), self.config.freshness_window) => {
                HealthStatus::degraded(
                    metadata,
                    status.last_error.unwrap_or_else(|| "key set is stale".to_owned()),
                )
            },
            Some(_) => HealthStatus::healthy(metadata),
        }
    }
}
