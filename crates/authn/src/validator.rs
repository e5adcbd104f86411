//! Bearer token validation.
//!
//! Nothing from the token is trusted until the signature checks out. The
//! header is decoded only to pick the key; the payload is not parsed until
//! after verification.

use std::{str::FromStr, sync::Arc};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::Algorithm;
use serde::Deserialize;

use crate::{
    claims::Claims,
    config::TokenConfig,
    error::{AuthError, ConfigError},
    jwks::SigningKey,
    key_cache::KeyCache,
    validation::{validate_algorithm, validate_kid},
};

/// The parts of a compact JWS, borrowed from the token string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenParts<'a> {
    /// Base64url header.
    pub header: &'a str,
    /// Base64url payload.
    pub payload: &'a str,
    /// Base64url signature.
    pub signature: &'a str,
    /// `header.payload`, the bytes that were signed.
    pub signing_input: &'a str,
}

impl<'a> TokenParts<'a> {
    /// Split a compact token into exactly three non-empty segments.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidTokenFormat`] otherwise.
    pub fn split(token: &'a str) -> Result<Self, AuthError> {
        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (segments.next(), segments.next(), segments.next(), segments.next())
        else {
            return Err(AuthError::invalid_token_format("JWT must have exactly 3 parts"));
        };
        if header.is_empty() || payload.is_empty() || signature.is_empty() {
            return Err(AuthError::invalid_token_format("JWT has an empty segment"));
        }
        let signing_input = &token[..header.len() + 1 + payload.len()];
        Ok(Self { header, payload, signature, signing_input })
    }
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Validates bearer tokens against a [`KeyCache`] and a [`TokenConfig`].
#[derive(Debug, Clone)]
pub struct TokenValidator {
    config: TokenConfig,
    keys: Arc<KeyCache>,
}

impl TokenValidator {
    /// Creates a validator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(config: TokenConfig, keys: Arc<KeyCache>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, keys })
    }

    /// The claims policy.
    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// The key cache this validator reads from.
    #[must_use]
    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    /// Validate `token` as of `now` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] for the first failed check. Checks run in
    /// this order: structure, algorithm, key identifier, key lookup,
    /// signature, claims parsing, issuer, audience, expiry, issued-at,
    /// not-before, maximum age.
    #[tracing::instrument(skip(self, token))]
    pub async fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, AuthError> {
        let parts = TokenParts::split(token)?;

        let header_bytes = URL_SAFE_NO_PAD
            .decode(parts.header)
            .map_err(|e| AuthError::invalid_token_format(format!("header is not base64url: {e}")))?;
        let header: RawHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| AuthError::invalid_token_format(format!("Failed to decode JWT header: {e}")))?;

        validate_algorithm(&header.alg)?;
        let algorithm = Algorithm::from_str(&header.alg)
            .map_err(|_| AuthError::unsupported_algorithm(format!("unknown algorithm '{}'", header.alg)))?;

        let kid = header
            .kid
            .ok_or_else(|| AuthError::invalid_token_format("JWT header missing 'kid'"))?;
        validate_kid(&kid)?;

        let key = self.resolve_key(&kid, now).await?;
        if key.algorithm != algorithm {
            return Err(AuthError::unsupported_algorithm(format!(
                "token algorithm {algorithm:?} does not match key '{kid}' ({:?})",
                key.algorithm
            )));
        }

        let verified = jsonwebtoken::crypto::verify(
            parts.signature,
            parts.signing_input.as_bytes(),
            &key.decoding_key,
            algorithm,
        );
        if !matches!(verified, Ok(true)) {
            tracing::debug!(kid = %kid, "signature verification failed");
            return Err(AuthError::invalid_signature());
        }

        let payload = URL_SAFE_NO_PAD
            .decode(parts.payload)
            .map_err(|e| AuthError::invalid_token_format(format!("payload is not base64url: {e}")))?;
        let claims = Claims::from_payload(&payload)?;
        self.check_claims(&claims, now)?;

        tracing::debug!(sub = %claims.sub, kid = %kid, "token validated");
        Ok(claims)
    }

    async fn resolve_key(&self, kid: &str, now: DateTime<Utc>) -> Result<Arc<SigningKey>, AuthError> {
        let keys = self.keys.get_keys(now).await?;
        if let Some(key) = keys.get(kid) {
            return Ok(Arc::clone(key));
        }

        match self.keys.refresh_for_unknown_kid(kid, now).await {
            Ok(Some(refreshed)) => {
                if let Some(key) = refreshed.get(kid) {
                    return Ok(Arc::clone(key));
                }
            },
            Ok(None) => {},
            Err(err) => {
                tracing::warn!(kid, error = %err, "refresh for unknown kid failed");
            },
        }
        Err(AuthError::unknown_key_id(kid))
    }

    fn check_claims(&self, claims: &Claims, now: DateTime<Utc>) -> Result<(), AuthError> {
        let now = now.timestamp();
        let leeway = i64::try_from(self.config.leeway.as_secs()).unwrap_or(i64::MAX);

        if claims.iss != self.config.issuer {
            return Err(AuthError::invalid_issuer(&claims.iss));
        }

        let audience_ok = claims.aud.iter().any(|a| self.config.audiences.contains(a))
            || (self.config.accept_authorized_party
                && claims.azp.as_ref().is_some_and(|azp| self.config.audiences.contains(azp)));
        if !audience_ok {
            return Err(AuthError::invalid_audience(format!(
                "none of {:?} is an accepted audience",
                claims.aud
            )));
        }

        if claims.exp < now.saturating_sub(leeway) {
            return Err(AuthError::token_expired());
        }

        if claims.iat > now.saturating_add(leeway) {
            return Err(AuthError::TokenIssuedInFuture);
        }

        if let Some(nbf) = claims.nbf
            && nbf > now.saturating_add(leeway)
        {
            return Err(AuthError::token_not_yet_valid());
        }

        if let Some(max_age) = self.config.max_token_age {
            let limit = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX).saturating_add(leeway);
            if now.saturating_sub(claims.iat) > limit {
                return Err(AuthError::TokenTooOld);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_split_three_parts() {
        let parts = TokenParts::split("aGVhZA.Ym9keQ.c2ln").unwrap();
        assert_eq!(parts.header, "aGVhZA");
        assert_eq!(parts.payload, "Ym9keQ");
        assert_eq!(parts.signature, "c2ln");
        assert_eq!(parts.signing_input, "aGVhZA.Ym9keQ");
    }

    #[test]
    fn test_split_rejects_wrong_part_counts() {
        for token in ["", "a", "a.b", "a.b.c.d", "a.b.c.d.e"] {
            assert!(
                matches!(TokenParts::split(token), Err(AuthError::InvalidTokenFormat { .. })),
                "{token:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_split_rejects_empty_segments() {
        for token in ["..", "a.b.", ".b.c", "a..c"] {
            assert!(TokenParts::split(token).is_err(), "{token:?} should be rejected");
        }
    }
}
