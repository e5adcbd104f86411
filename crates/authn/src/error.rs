//! Authentication, webhook and configuration error types.
//!
//! Token rejections are all surfaced to callers as one "unauthenticated"
//! outcome, but each [`AuthError`] variant carries a stable
//! [`reason`](AuthError::reason) code so logs say exactly why.
//! [`AuthError::is_infrastructure`] separates "the key source is down"
//! from "the caller sent a bad token".

use std::time::Duration;

use corpdir_storage::{BoxError, StorageError};
use thiserror::Error;

/// Authentication errors produced while admitting a bearer token.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// No credentials were presented.
    #[error("Missing credentials")]
    MissingCredentials,

    /// Malformed token or Authorization header.
    #[error("Invalid token format: {message}")]
    InvalidTokenFormat {
        /// What was wrong with the token.
        message: String,
    },

    /// Algorithm is forbidden, unknown, or does not match the key.
    #[error("Unsupported algorithm: {message}")]
    UnsupportedAlgorithm {
        /// Why the algorithm was refused.
        message: String,
    },

    /// The header names a key identifier the key source does not publish.
    #[error("Unknown signing key: {kid}")]
    UnknownKeyId {
        /// Key ID asserted by the token header.
        kid: String,
    },

    /// Signature verification failed.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Required claim is missing.
    #[error("Missing claim: {claim}")]
    MissingClaim {
        /// Name of the missing claim.
        claim: String,
    },

    /// Issuer does not match the configured issuer.
    #[error("Invalid issuer: {actual}")]
    InvalidIssuer {
        /// Issuer found in the token.
        actual: String,
    },

    /// None of the token's audiences is accepted.
    #[error("Invalid audience: {message}")]
    InvalidAudience {
        /// Details of the mismatch.
        message: String,
    },

    /// Token has expired, even after applying leeway.
    #[error("Token expired")]
    TokenExpired,

    /// Token claims to be issued in the future, beyond leeway.
    #[error("Token issued in the future")]
    TokenIssuedInFuture,

    /// Token not yet valid (`nbf` in the future, beyond leeway).
    #[error("Token not yet valid")]
    TokenNotYetValid,

    /// Token issued longer ago than the configured maximum age.
    #[error("Token too old")]
    TokenTooOld,

    /// A published key could not be turned into a verification key.
    #[error("Invalid public key: {message}")]
    InvalidPublicKey {
        /// Why the key was rejected.
        message: String,
    },

    /// Fetching the key set from its source failed.
    #[error("Key source error: {message}")]
    KeySource {
        /// Description of the failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// No usable key set is available: never fetched, or older than the
    /// staleness ceiling and the source cannot be reached.
    #[error("Signing keys unavailable: {message}")]
    KeysUnavailable {
        /// Description of the last failure.
        message: String,
    },
}

impl AuthError {
    /// Creates an `InvalidTokenFormat` error.
    #[must_use]
    pub fn invalid_token_format(message: impl Into<String>) -> Self {
        Self::InvalidTokenFormat { message: message.into() }
    }

    /// Creates an `UnsupportedAlgorithm` error.
    #[must_use]
    pub fn unsupported_algorithm(message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm { message: message.into() }
    }

    /// Creates an `UnknownKeyId` error.
    #[must_use]
    pub fn unknown_key_id(kid: impl Into<String>) -> Self {
        Self::UnknownKeyId { kid: kid.into() }
    }

    /// Creates an `InvalidSignature` error.
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::InvalidSignature
    }

    /// Creates a `MissingClaim` error.
    #[must_use]
    pub fn missing_claim(claim: impl Into<String>) -> Self {
        Self::MissingClaim { claim: claim.into() }
    }

    /// Creates an `InvalidIssuer` error.
    #[must_use]
    pub fn invalid_issuer(actual: impl Into<String>) -> Self {
        Self::InvalidIssuer { actual: actual.into() }
    }

    /// Creates an `InvalidAudience` error.
    #[must_use]
    pub fn invalid_audience(message: impl Into<String>) -> Self {
        Self::InvalidAudience { message: message.into() }
    }

    /// Creates a `TokenExpired` error.
    #[must_use]
    pub fn token_expired() -> Self {
        Self::TokenExpired
    }

    /// Creates a `TokenNotYetValid` error.
    #[must_use]
    pub fn token_not_yet_valid() -> Self {
        Self::TokenNotYetValid
    }

    /// Creates an `InvalidPublicKey` error.
    #[must_use]
    pub fn invalid_public_key(message: impl Into<String>) -> Self {
        Self::InvalidPublicKey { message: message.into() }
    }

    /// Creates a `KeySource` error without a source.
    #[must_use]
    pub fn key_source(message: impl Into<String>) -> Self {
        Self::KeySource { message: message.into(), source: None }
    }

    /// Creates a `KeySource` error with the underlying cause.
    #[must_use]
    pub fn key_source_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::KeySource { message: message.into(), source: Some(std::sync::Arc::new(source)) }
    }

    /// Creates a `KeysUnavailable` error.
    #[must_use]
    pub fn keys_unavailable(message: impl Into<String>) -> Self {
        Self::KeysUnavailable { message: message.into() }
    }

    /// Stable, machine-readable code for logs.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::InvalidTokenFormat { .. } => "invalid_token_format",
            Self::UnsupportedAlgorithm { .. } => "unsupported_algorithm",
            Self::UnknownKeyId { .. } => "unknown_key_id",
            Self::InvalidSignature => "invalid_signature",
            Self::MissingClaim { .. } => "missing_claim",
            Self::InvalidIssuer { .. } => "invalid_issuer",
            Self::InvalidAudience { .. } => "invalid_audience",
            Self::TokenExpired => "token_expired",
            Self::TokenIssuedInFuture => "token_issued_in_future",
            Self::TokenNotYetValid => "token_not_yet_valid",
            Self::TokenTooOld => "token_too_old",
            Self::InvalidPublicKey { .. } => "invalid_public_key",
            Self::KeySource { .. } => "key_source_error",
            Self::KeysUnavailable { .. } => "keys_unavailable",
        }
    }

    /// Returns `true` when the failure is ours, not the caller's.
    ///
    /// These map to a service-not-ready response instead of "unauthenticated".
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::KeySource { .. } | Self::KeysUnavailable { .. })
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Faults raised while verifying a webhook delivery.
///
/// Expected rejections (bad signature, stale timestamp, duplicate) are
/// [`DeliveryVerdict`](crate::webhook::DeliveryVerdict)s, not errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WebhookError {
    /// The body is not a well-formed delivery document.
    #[error("Malformed delivery: {message}")]
    MalformedDelivery {
        /// What could not be parsed.
        message: String,
    },

    /// The replay store failed while recording the delivery.
    #[error("Replay store error: {0}")]
    ReplayStore(
        /// The underlying storage error.
        #[source]
        StorageError,
    ),

    /// The replay store did not answer within the configured bound.
    #[error("Replay store timed out after {timeout:?}")]
    ReplayTimeout {
        /// The bound that elapsed.
        timeout: Duration,
    },
}

impl WebhookError {
    /// Creates a `MalformedDelivery` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedDelivery { message: message.into() }
    }
}

impl From<StorageError> for WebhookError {
    fn from(err: StorageError) -> Self {
        Self::ReplayStore(err)
    }
}

/// Invalid or unsafe configuration, detected at construction time.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required setting is absent or empty.
    #[error("Missing configuration: {field}")]
    MissingField {
        /// Name of the setting.
        field: String,
    },

    /// A setting has an unusable value.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidValue {
        /// Name of the setting.
        field: String,
        /// Why the value was rejected.
        message: String,
    },

    /// The development bypass was enabled under production trust.
    #[error("Development authentication bypass cannot be enabled in production trust mode")]
    InsecureDevelopmentBypass,
}

impl ConfigError {
    /// Creates a `MissingField` error.
    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField { field: field.into() }
    }

    /// Creates an `InvalidValue` error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue { field: field.into(), message: message.into() }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            AuthError::invalid_token_format("test").to_string(),
            "Invalid token format: test"
        );
        assert_eq!(AuthError::token_expired().to_string(), "Token expired");
        assert_eq!(AuthError::missing_claim("sub").to_string(), "Missing claim: sub");
        assert_eq!(AuthError::unknown_key_id("k1").to_string(), "Unknown signing key: k1");
    }

    #[test]
    fn test_reason_codes_are_distinct() {
        let errors = [
            AuthError::MissingCredentials,
            AuthError::invalid_token_format("x"),
            AuthError::unsupported_algorithm("x"),
            AuthError::unknown_key_id("x"),
            AuthError::invalid_signature(),
            AuthError::missing_claim("x"),
            AuthError::invalid_issuer("x"),
            AuthError::invalid_audience("x"),
            AuthError::token_expired(),
            AuthError::TokenIssuedInFuture,
            AuthError::token_not_yet_valid(),
            AuthError::TokenTooOld,
            AuthError::invalid_public_key("x"),
            AuthError::key_source("x"),
            AuthError::keys_unavailable("x"),
        ];
        let reasons: std::collections::BTreeSet<_> = errors.iter().map(AuthError::reason).collect();
        assert_eq!(reasons.len(), errors.len());
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(AuthError::keys_unavailable("never fetched").is_infrastructure());
        assert!(AuthError::key_source("timeout").is_infrastructure());
        assert!(!AuthError::invalid_signature().is_infrastructure());
        assert!(!AuthError::unknown_key_id("kid").is_infrastructure());
    }

    #[test]
    fn test_key_source_preserves_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = AuthError::key_source_with_source("fetch failed", io);

        let source = err.source().expect("source chain must be preserved");
        assert_eq!(source.to_string(), "refused");
    }

    #[test]
    fn test_webhook_error_wraps_storage_error() {
        let err: WebhookError = StorageError::timeout().into();
        assert_eq!(err.to_string(), "Replay store error: Operation timeout");
        assert_eq!(err.source().expect("source").to_string(), "Operation timeout");
    }

    #[test]
    fn test_config_error_display() {
        assert_eq!(ConfigError::missing("issuer").to_string(), "Missing configuration: issuer");
        assert_eq!(
            ConfigError::invalid("leeway", "too large").to_string(),
            "Invalid configuration for leeway: too large"
        );
    }
}
