//! Optimistic concurrency over a [`StorageBackend`].
//!
//! Resources are stored as their canonical JSON bytes under
//! `<namespace>/<id>`. The version token is derived from those bytes, so the
//! stored record itself is the version field: a commit is a single
//! `compare_and_set` against the exact bytes observed at prepare time, and
//! a concurrent writer that got there first makes it fail instead of queue.
//!
//! ```text
//! read ─────────► (state, v1)
//! check_and_prepare(id, Some(v1))
//!   current == v1 ──► Allowed(Prepared { observed bytes })
//!   current != v1 ──► Conflict { current }
//! commit(prepared, new_state)
//!   CAS(observed → new) ok ──► Committed(v2)
//!   CAS lost              ──► Conflict
//! ```

use bytes::Bytes;
use corpdir_storage::{StorageBackend, StorageError};
use fail::fail_point;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::{ConcurrencyError, Result},
    version::{VersionToken, canonical_bytes},
};

/// A resource state together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The state.
    pub state: T,
    /// Version of `state`.
    pub version: VersionToken,
}

/// Permission to commit, carrying what the check observed.
///
/// Only [`ConcurrencyController::check_and_prepare`] creates one.
#[derive(Debug, Clone)]
pub struct Prepared<T> {
    id: String,
    observed: Bytes,
    current: Versioned<T>,
}

impl<T> Prepared<T> {
    /// Resource id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The state and version the check admitted against.
    #[must_use]
    pub fn current(&self) -> &Versioned<T> {
        &self.current
    }
}

/// Result of [`ConcurrencyController::check_and_prepare`].
#[derive(Debug, Clone)]
#[must_use]
pub enum Admission<T> {
    /// The expected version is current.
    Allowed(Prepared<T>),
    /// The resource changed since the caller read it.
    Conflict {
        /// The version the caller should re-read.
        current: VersionToken,
    },
}

/// Result of [`ConcurrencyController::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum CommitOutcome {
    /// Written; the new version.
    Committed(VersionToken),
    /// Another writer committed between prepare and commit.
    Conflict,
}

/// Result of [`ConcurrencyController::update`].
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum UpdateOutcome<T> {
    /// Written.
    Updated(Versioned<T>),
    /// The expected version was stale, either at check or at commit time.
    Conflict,
}

/// Guards mutations of one resource namespace.
///
/// Stateless between requests: everything it compares lives in storage.
#[derive(Debug, Clone)]
pub struct ConcurrencyController<B> {
    backend: B,
    namespace: String,
}

impl<B: StorageBackend> ConcurrencyController<B> {
    /// A controller for resources stored under `namespace/`.
    pub fn new(backend: B, namespace: impl Into<String>) -> Self {
        Self { backend, namespace: namespace.into() }
    }

    /// The storage backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Storage key of resource `id`.
    #[must_use]
    pub fn storage_key(&self, id: &str) -> Vec<u8> {
        format!("{}/{id}", self.namespace).into_bytes()
    }

    /// Store a new resource.
    ///
    /// # Errors
    ///
    /// [`ConcurrencyError::AlreadyExists`] if `id` is taken; serialization
    /// and storage faults otherwise.
    #[tracing::instrument(skip(self, state), fields(resource_id = %id))]
    pub async fn create<T: Serialize>(&self, id: &str, state: &T) -> Result<VersionToken> {
        let bytes = canonical_bytes(state)?;
        let version = VersionToken::from_canonical_bytes(&bytes);

        match self.backend.compare_and_set(&self.storage_key(id), None, bytes).await {
            Ok(()) => {
                tracing::debug!(version = %version, "resource created");
                Ok(version)
            },
            Err(StorageError::Conflict) => Err(ConcurrencyError::already_exists(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Current state and version of `id`.
    ///
    /// # Errors
    ///
    /// [`ConcurrencyError::NotFound`] if absent; serialization and storage
    /// faults otherwise.
    pub async fn read<T: DeserializeOwned>(&self, id: &str) -> Result<Versioned<T>> {
        let (_, current) = self.load(id).await?;
        Ok(current)
    }

    /// Admit a mutation of `id` if `expected` is still current.
    ///
    /// # Errors
    ///
    /// - [`ConcurrencyError::PreconditionRequired`] when `expected` is
    ///   `None`; an unconditional write is a caller error, not a match.
    /// - [`ConcurrencyError::NotFound`] if `id` does not exist.
    #[tracing::instrument(skip(self, expected), fields(resource_id = %id))]
    pub async fn check_and_prepare<T: DeserializeOwned>(
        &self,
        id: &str,
        expected: Option<&VersionToken>,
    ) -> Result<Admission<T>> {
        let expected = expected.ok_or(ConcurrencyError::PreconditionRequired)?;
        let (observed, current) = self.load(id).await?;

        if current.version != *expected {
            tracing::info!(
                expected = %expected,
                current = %current.version,
                reason = "version_mismatch",
                "mutation rejected"
            );
            return Ok(Admission::Conflict { current: current.version });
        }

        Ok(Admission::Allowed(Prepared { id: id.to_owned(), observed, current }))
    }

    /// Write `new_state` if the resource still holds what `prepared` saw.
    ///
    /// # Errors
    ///
    /// Serialization and storage faults. A lost race is
    /// [`CommitOutcome::Conflict`], not an error.
    #[tracing::instrument(skip_all, fields(resource_id = %prepared.id))]
    pub async fn commit<T, U: Serialize>(
        &self,
        prepared: Prepared<T>,
        new_state: &U,
    ) -> Result<CommitOutcome> {
        let bytes = canonical_bytes(new_state)?;
        let version = VersionToken::from_canonical_bytes(&bytes);

        fail_point!("controller-before-commit", |_| {
            Err(ConcurrencyError::Storage(StorageError::internal("injected commit failure")))
        });

        let key = self.storage_key(&prepared.id);
        match self.backend.compare_and_set(&key, Some(prepared.observed.as_ref()), bytes).await {
            Ok(()) => {
                tracing::info!(
                    audit.action = "resource_updated",
                    previous = %prepared.current.version,
                    version = %version,
                    "resource committed"
                );
                Ok(CommitOutcome::Committed(version))
            },
            Err(StorageError::Conflict) => {
                tracing::info!(reason = "concurrent_commit", "commit lost to a concurrent writer");
                Ok(CommitOutcome::Conflict)
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Check `expected`, apply `mutate` to the current state, and commit.
    ///
    /// # Errors
    ///
    /// As [`check_and_prepare`](Self::check_and_prepare) and
    /// [`commit`](Self::commit).
    pub async fn update<T, F>(
        &self,
        id: &str,
        expected: Option<&VersionToken>,
        mutate: F,
    ) -> Result<UpdateOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce(T) -> T,
    {
        let prepared = match self.check_and_prepare::<T>(id, expected).await? {
            Admission::Allowed(prepared) => prepared,
            Admission::Conflict { .. } => return Ok(UpdateOutcome::Conflict),
        };

        let new_state = mutate(prepared.current.state.clone());
        match self.commit(prepared, &new_state).await? {
            CommitOutcome::Committed(version) => {
                Ok(UpdateOutcome::Updated(Versioned { state: new_state, version }))
            },
            CommitOutcome::Conflict => Ok(UpdateOutcome::Conflict),
        }
    }

    async fn load<T: DeserializeOwned>(&self, id: &str) -> Result<(Bytes, Versioned<T>)> {
        let bytes = self
            .backend
            .get(&self.storage_key(id))
            .await?
            .ok_or_else(|| ConcurrencyError::not_found(id))?;
        let state = serde_json::from_slice(&bytes)
            .map_err(|e| ConcurrencyError::serialization(format!("decode resource '{id}'"), e))?;
        let version = VersionToken::from_canonical_bytes(&bytes);
        Ok((bytes, Versioned { state, version }))
    }
}
