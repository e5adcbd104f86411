//! Health check types for storage backends.
//!
//! [`StorageBackend::health_check`](crate::StorageBackend::health_check) returns a
//! [`HealthStatus`] for a given [`HealthProbe`]. The HTTP readiness endpoint
//! combines the storage readiness probe with the key cache state.
//!
//! | `HealthProbe`  | `HealthStatus` | HTTP Status |
//! |----------------|----------------|-------------|
//! | `Liveness`     | `Healthy`      | 200 OK      |
//! | `Readiness`    | `Healthy`      | 200 OK      |
//! | `Readiness`    | `Degraded`     | 200 OK      |
//! | `Readiness`    | `Unhealthy`    | 503         |

use std::{collections::BTreeMap, fmt, time::Duration};

/// The type of health probe to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthProbe {
    /// Process is alive and not deadlocked.
    Liveness,
    /// Backend can serve traffic.
    Readiness,
}

impl fmt::Display for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Liveness => write!(f, "liveness"),
            Self::Readiness => write!(f, "readiness"),
        }
    }
}

/// Health status returned by a backend.
#[derive(Debug, Clone)]
pub enum HealthStatus {
    /// Backend is fully operational.
    Healthy(HealthMetadata),
    /// Backend serves traffic with reduced capability.
    Degraded(HealthMetadata, String),
    /// Backend cannot serve traffic reliably.
    Unhealthy(HealthMetadata, String),
}

impl HealthStatus {
    /// Creates a `Healthy` status.
    #[must_use = "creating a status has no side effects"]
    pub fn healthy(metadata: HealthMetadata) -> Self {
        Self::Healthy(metadata)
    }

    /// Creates a `Degraded` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn degraded(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Degraded(metadata, reason.into())
    }

    /// Creates an `Unhealthy` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn unhealthy(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Unhealthy(metadata, reason.into())
    }

    /// Returns `true` unless the backend is unhealthy.
    ///
    /// A degraded backend still serves traffic.
    #[must_use = "health status predicates should be checked"]
    pub fn can_serve(&self) -> bool {
        !matches!(self, Self::Unhealthy(..))
    }

    /// Returns the metadata associated with this status.
    #[must_use]
    pub fn metadata(&self) -> &HealthMetadata {
        match self {
            Self::Healthy(m) | Self::Degraded(m, _) | Self::Unhealthy(m, _) => m,
        }
    }

    /// Returns the degradation or failure reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Healthy(_) => None,
            Self::Degraded(_, reason) | Self::Unhealthy(_, reason) => Some(reason),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.metadata().check_duration.as_millis();
        match self {
            Self::Healthy(_) => write!(f, "healthy ({ms}ms)"),
            Self::Degraded(_, reason) => write!(f, "degraded: {reason} ({ms}ms)"),
            Self::Unhealthy(_, reason) => write!(f, "unhealthy: {reason} ({ms}ms)"),
        }
    }
}

/// Metadata about a health check result.
#[derive(Debug, Clone)]
pub struct HealthMetadata {
    /// How long the health check itself took.
    pub check_duration: Duration,
    /// Identifier for the backend type (e.g. `"memory"`).
    pub backend: String,
    /// Backend-specific details such as `entry_count`.
    pub details: BTreeMap<String, String>,
}

impl HealthMetadata {
    /// Creates metadata with the given check duration and backend name.
    #[must_use]
    pub fn new(check_duration: Duration, backend: impl Into<String>) -> Self {
        Self { check_duration, backend: backend.into(), details: BTreeMap::new() }
    }

    /// Adds a detail entry, returning `self` for chaining.
    #[must_use = "returns the modified metadata for chaining"]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_can_still_serve() {
        let meta = HealthMetadata::new(Duration::from_millis(50), "memory");
        let status = HealthStatus::degraded(meta, "elevated latency");

        assert!(status.can_serve());
        assert_eq!(status.reason(), Some("elevated latency"));
    }

    #[test]
    fn test_unhealthy_cannot_serve() {
        let meta = HealthMetadata::new(Duration::from_millis(1000), "memory");
        let status = HealthStatus::unhealthy(meta, "lock poisoned");

        assert!(!status.can_serve());
        assert_eq!(status.to_string(), "unhealthy: lock poisoned (1000ms)");
    }

    #[test]
    fn test_metadata_details() {
        let meta = HealthMetadata::new(Duration::from_millis(2), "memory")
            .with_detail("entry_count", "42");
        let status = HealthStatus::healthy(meta);

        assert_eq!(status.to_string(), "healthy (2ms)");
        assert_eq!(status.metadata().details.get("entry_count").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_probe_display() {
        assert_eq!(HealthProbe::Liveness.to_string(), "liveness");
        assert_eq!(HealthProbe::Readiness.to_string(), "readiness");
    }
}
