//! Inbound webhook verification.
//!
//! Each delivery ends in exactly one terminal verdict:
//!
//! ```text
//! received ─► signature ok? ──no──► signature_invalid
//!                 │ yes
//!                 ▼
//!             fresh? ──no──► expired
//!                 │ yes
//!                 ▼
//!         replay guard: new? ──no──► duplicate
//!                 │ yes
//!                 ▼
//!              accepted
//! ```
//!
//! The signature is checked first so an unauthenticated sender cannot learn
//! anything about timing or duplicate state.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    config::WebhookConfig,
    error::{ConfigError, WebhookError},
    replay::{ReplayGuard, ReplayStatus},
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "x-signature";

const SIGNATURE_PREFIX: &str = "sha256=";

/// A webhook body.
///
/// ```json
/// {"source":"crm-x","sourceKey":"contact-42","payload":{...},"nonce":"n1","ts":1700000000}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Sending system.
    pub source: String,
    /// The sender's identifier for the affected record.
    #[serde(rename = "sourceKey", default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    /// Opaque event payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Sender-chosen unique string.
    pub nonce: String,
    /// Declared send time, seconds since epoch.
    pub ts: i64,
}

impl WebhookDelivery {
    /// Parse a raw body.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::MalformedDelivery`] if the body is not a
    /// delivery document or `source`/`nonce` is empty.
    pub fn parse(raw: &[u8]) -> Result<Self, WebhookError> {
        let delivery: Self = serde_json::from_slice(raw)
            .map_err(|e| WebhookError::malformed(format!("invalid delivery body: {e}")))?;
        if delivery.source.is_empty() {
            return Err(WebhookError::malformed("source must not be empty"));
        }
        if delivery.nonce.is_empty() {
            return Err(WebhookError::malformed("nonce must not be empty"));
        }
        Ok(delivery)
    }
}

/// Terminal outcome for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryVerdict {
    /// Authentic, fresh and new. The caller should process it.
    Accepted,
    /// Already accepted once. Do not retry.
    Duplicate,
    /// Signature missing or wrong. Never retry unmodified.
    SignatureInvalid,
    /// Declared timestamp outside the acceptance window.
    Expired,
}

impl DeliveryVerdict {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
            Self::SignatureInvalid => "signature_invalid",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for DeliveryVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared secrets per source. A source may list several to allow rotation.
#[derive(Default)]
pub struct WebhookSecrets {
    secrets: HashMap<String, Vec<Zeroizing<Vec<u8>>>>,
}

impl fmt::Debug for WebhookSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<&str, usize> =
            self.secrets.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("WebhookSecrets").field("sources", &counts).finish()
    }
}

impl WebhookSecrets {
    /// Decode hex-encoded secrets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for non-hex or empty secrets.
    pub fn from_hex(secrets: &BTreeMap<String, Vec<String>>) -> Result<Self, ConfigError> {
        let mut decoded = Self::default();
        for (source, list) in secrets {
            for secret in list {
                let bytes = Zeroizing::new(hex::decode(secret.trim()).map_err(|e| {
                    ConfigError::invalid("webhook_secrets", format!("source '{source}': {e}"))
                })?);
                if bytes.is_empty() {
                    return Err(ConfigError::invalid(
                        "webhook_secrets",
                        format!("source '{source}' has an empty secret"),
                    ));
                }
                decoded.secrets.entry(source.clone()).or_default().push(bytes);
            }
        }
        Ok(decoded)
    }

    /// Add a raw secret for `source`.
    pub fn insert(&mut self, source: impl Into<String>, secret: impl Into<Vec<u8>>) {
        self.secrets.entry(source.into()).or_default().push(Zeroizing::new(secret.into()));
    }

    /// Whether any secret is configured for `source`.
    #[must_use]
    pub fn contains_source(&self, source: &str) -> bool {
        self.secrets.contains_key(source)
    }

    /// Check `signature` against every secret for `source`.
    ///
    /// All secrets are tried even after a match, and each comparison is
    /// constant-time, so timing does not reveal which secret matched.
    fn verify(&self, source: &str, body: &[u8], signature: &[u8]) -> bool {
        let Some(list) = self.secrets.get(source) else {
            return false;
        };
        let mut matched = false;
        for secret in list {
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_slice()) else {
                continue;
            };
            mac.update(body);
            matched |= mac.verify_slice(signature).is_ok();
        }
        matched
    }
}

/// Decode a `sha256=<hex>` header value into the 32 digest bytes.
#[must_use]
pub fn parse_signature_header(value: &str) -> Option<Vec<u8>> {
    let hex_digest = value.trim().strip_prefix(SIGNATURE_PREFIX)?;
    let bytes = hex::decode(hex_digest).ok()?;
    (bytes.len() == 32).then_some(bytes)
}

/// Verifies deliveries and records them in a [`ReplayGuard`].
pub struct WebhookVerifier {
    secrets: WebhookSecrets,
    guard: Arc<dyn ReplayGuard>,
    window: Duration,
    replay_timeout: Duration,
}

impl fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secrets", &self.secrets)
            .field("window", &self.window)
            .field("replay_timeout", &self.replay_timeout)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    /// Creates a verifier from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for undecodable secrets or a zero window.
    pub fn new(config: &WebhookConfig, guard: Arc<dyn ReplayGuard>) -> Result<Self, ConfigError> {
        if config.acceptance_window.is_zero() {
            return Err(ConfigError::invalid("acceptance_window", "must be non-zero"));
        }
        Ok(Self {
            secrets: WebhookSecrets::from_hex(&config.secrets)?,
            guard,
            window: config.acceptance_window,
            replay_timeout: config.replay_timeout,
        })
    }

    /// The acceptance window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether `declared_ts` is inside the window around `now`.
    ///
    /// Accepted iff `-window < now - declared_ts <= window`: a timestamp
    /// exactly one window old is still fresh, one exactly one window ahead
    /// is not.
    #[must_use]
    pub fn is_fresh(&self, declared_ts: i64, now: DateTime<Utc>) -> bool {
        let window = i128::from(self.window.as_secs());
        let age = i128::from(now.timestamp()) - i128::from(declared_ts);
        -window < age && age <= window
    }

    /// Verify one delivery.
    ///
    /// # Errors
    ///
    /// Only infrastructure faults are errors: the replay store failing or
    /// not answering within the configured bound. Every rejection is a
    /// [`DeliveryVerdict`].
    #[tracing::instrument(skip(self, raw_body, declared_signature, now))]
    pub async fn verify(
        &self,
        raw_body: &[u8],
        declared_signature: &str,
        declared_ts: i64,
        source: &str,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryVerdict, WebhookError> {
        let authentic = parse_signature_header(declared_signature)
            .is_some_and(|sig| self.secrets.verify(source, raw_body, &sig));
        if !authentic {
            tracing::warn!(reason = "signature_invalid", "webhook rejected");
            return Ok(DeliveryVerdict::SignatureInvalid);
        }

        if !self.is_fresh(declared_ts, now) {
            tracing::warn!(reason = "expired", now = now.timestamp(), "webhook rejected");
            return Ok(DeliveryVerdict::Expired);
        }

        let status = tokio::time::timeout(
            self.replay_timeout,
            self.guard.check_and_mark(source, nonce, declared_ts, now),
        )
        .await
        .map_err(|_| WebhookError::ReplayTimeout { timeout: self.replay_timeout })??;

        match status {
            ReplayStatus::Fresh => {
                tracing::info!(audit.action = "webhook_accepted", "webhook accepted");
                Ok(DeliveryVerdict::Accepted)
            },
            ReplayStatus::Duplicate => {
                tracing::info!(reason = "duplicate", "webhook already processed");
                Ok(DeliveryVerdict::Duplicate)
            },
        }
    }

    /// Undo the replay record of an accepted delivery whose payload could
    /// not be handed off, so the sender's retry is accepted again.
    ///
    /// # Errors
    ///
    /// Replay-store failure or timeout.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, source: &str, nonce: &str) -> Result<(), WebhookError> {
        tokio::time::timeout(self.replay_timeout, self.guard.release(source, nonce))
            .await
            .map_err(|_| WebhookError::ReplayTimeout { timeout: self.replay_timeout })??;
        tracing::info!(audit.action = "webhook_released", "accepted delivery released for redelivery");
        Ok(())
    }

    /// Parse `raw_body` and verify it with the signature header value, if any.
    ///
    /// Returns the parsed delivery alongside the verdict so the caller can
    /// forward the payload on [`DeliveryVerdict::Accepted`].
    ///
    /// # Errors
    ///
    /// [`WebhookError::MalformedDelivery`] for unparseable bodies, plus
    /// everything [`verify`](Self::verify) returns.
    pub async fn verify_request(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(WebhookDelivery, DeliveryVerdict), WebhookError> {
        let delivery = WebhookDelivery::parse(raw_body)?;
        let verdict = self
            .verify(
                raw_body,
                signature_header.unwrap_or_default(),
                delivery.ts,
                &delivery.source,
                &delivery.nonce,
                now,
            )
            .await?;
        Ok((delivery, verdict))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testutil::sign_webhook;

    #[test]
    fn test_parse_delivery() {
        let raw = br#"{"source":"crm-x","sourceKey":"c-42","payload":{"a":1},"nonce":"n1","ts":1700000000}"#;
        let delivery = WebhookDelivery::parse(raw).unwrap();
        assert_eq!(delivery.source, "crm-x");
        assert_eq!(delivery.source_key.as_deref(), Some("c-42"));
        assert_eq!(delivery.payload, json!({"a": 1}));
        assert_eq!(delivery.ts, 1_700_000_000);
    }

    #[test]
    fn test_parse_minimal_delivery() {
        let delivery = WebhookDelivery::parse(br#"{"source":"crm-x","nonce":"n1","ts":5}"#).unwrap();
        assert!(delivery.source_key.is_none());
        assert!(delivery.payload.is_null());
    }

    #[test]
    fn test_parse_malformed() {
        for raw in [
            &b"not json"[..],
            br#"{"source":"crm-x","ts":5}"#,
            br#"{"source":"","nonce":"n","ts":5}"#,
            br#"{"source":"s","nonce":"","ts":5}"#,
            br#"{"source":"s","nonce":"n","ts":"yesterday"}"#,
        ] {
            assert!(
                matches!(WebhookDelivery::parse(raw), Err(WebhookError::MalformedDelivery { .. })),
                "{}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_parse_signature_header() {
        let header = sign_webhook(b"secret", b"body");
        assert_eq!(parse_signature_header(&header).unwrap().len(), 32);
        assert!(parse_signature_header("sha1=abcd").is_none());
        assert!(parse_signature_header("sha256=zz").is_none());
        assert!(parse_signature_header("sha256=abcd").is_none());
        assert!(parse_signature_header("").is_none());
    }

    #[test]
    fn test_secrets_any_listed_secret_verifies() {
        let mut secrets = WebhookSecrets::default();
        secrets.insert("crm-x", b"old".to_vec());
        secrets.insert("crm-x", b"new".to_vec());

        for key in [&b"old"[..], b"new"] {
            let sig = parse_signature_header(&sign_webhook(key, b"body")).unwrap();
            assert!(secrets.verify("crm-x", b"body", &sig));
        }
        let other = parse_signature_header(&sign_webhook(b"other", b"body")).unwrap();
        assert!(!secrets.verify("crm-x", b"body", &other));
        assert!(!secrets.verify("unknown", b"body", &other));
    }

    #[test]
    fn test_secrets_from_hex() {
        let map = BTreeMap::from([("crm-x".to_owned(), vec!["00ff".to_owned(), "abcd".to_owned()])]);
        let secrets = WebhookSecrets::from_hex(&map).unwrap();
        assert!(secrets.contains_source("crm-x"));
        assert!(!format!("{secrets:?}").contains("00ff"));

        let bad = BTreeMap::from([("crm-x".to_owned(), vec!["xyz".to_owned()])]);
        assert!(WebhookSecrets::from_hex(&bad).is_err());
        let empty = BTreeMap::from([("crm-x".to_owned(), vec![String::new()])]);
        assert!(WebhookSecrets::from_hex(&empty).is_err());
    }

    #[test]
    fn test_verdict_wire_names() {
        assert_eq!(DeliveryVerdict::Accepted.as_str(), "accepted");
        assert_eq!(DeliveryVerdict::SignatureInvalid.to_string(), "signature_invalid");
        assert_eq!(serde_json::to_value(DeliveryVerdict::Expired).unwrap(), json!("expired"));
    }
}
