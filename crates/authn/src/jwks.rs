//! JWKS documents and the verification keys built from them.
//!
//! A [`JwkSet`] is the wire format published by the identity provider. It is
//! converted once, at fetch time, into an immutable [`KeySet`] of
//! [`SigningKey`]s that the validator can use directly.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, VerifyingKey};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Smallest RSA modulus accepted, in bits.
pub const MIN_RSA_MODULUS_BITS: usize = 2048;

/// A single JSON Web Key, restricted to the members this crate reads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type: `RSA` or `OKP`.
    pub kty: String,
    /// Key identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Declared algorithm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Intended use. Only `sig` (or absent) is accepted.
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// RSA modulus, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA public exponent, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// OKP curve name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// OKP public key, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
}

/// A JWKS document: `{"keys": [...]}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// Published keys.
    pub keys: Vec<Jwk>,
}

/// A verification key ready for use.
///
/// Immutable once built. `retired_at` is only set by the retain-retired
/// rotation policy, when the key has disappeared from the source.
#[derive(Clone)]
pub struct SigningKey {
    /// Key identifier.
    pub kid: String,
    /// The only algorithm this key verifies.
    pub algorithm: Algorithm,
    /// Verification key material.
    pub decoding_key: DecodingKey,
    /// When the key set containing this key was fetched.
    pub fetched_at: DateTime<Utc>,
    /// When the key was first observed missing from the source.
    pub retired_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("fetched_at", &self.fetched_at)
            .field("retired_at", &self.retired_at)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Build a verification key from a JWK entry.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidPublicKey`] if the entry has no `kid`, an
    /// unsupported key type or algorithm, or malformed key material.
    pub fn from_jwk(jwk: &Jwk, fetched_at: DateTime<Utc>) -> Result<Self, AuthError> {
        let kid = jwk
            .kid
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AuthError::invalid_public_key("JWK has no kid"))?
            .to_owned();

        let (algorithm, decoding_key) = match jwk.kty.as_str() {
            "RSA" => rsa_key(jwk)?,
            "OKP" => ed25519_key(jwk)?,
            other => {
                return Err(AuthError::invalid_public_key(format!(
                    "unsupported key type '{other}'"
                )));
            },
        };

        Ok(Self { kid, algorithm, decoding_key, fetched_at, retired_at: None })
    }
}

fn rsa_key(jwk: &Jwk) -> Result<(Algorithm, DecodingKey), AuthError> {
    let algorithm = match jwk.alg.as_deref() {
        None => Algorithm::RS256,
        Some(alg @ ("RS256" | "RS384" | "RS512")) => Algorithm::from_str(alg)
            .map_err(|e| AuthError::invalid_public_key(e.to_string()))?,
        Some(other) => {
            return Err(AuthError::invalid_public_key(format!(
                "algorithm '{other}' is not valid for an RSA key"
            )));
        },
    };

    let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
        return Err(AuthError::invalid_public_key("RSA key is missing n or e"));
    };

    let modulus = URL_SAFE_NO_PAD
        .decode(n)
        .map_err(|e| AuthError::invalid_public_key(format!("base64 decode of n: {e}")))?;
    let significant = modulus.iter().skip_while(|b| **b == 0).count();
    if significant * 8 < MIN_RSA_MODULUS_BITS {
        return Err(AuthError::invalid_public_key(format!(
            "RSA modulus shorter than {MIN_RSA_MODULUS_BITS} bits"
        )));
    }

    let key = DecodingKey::from_rsa_components(n, e)
        .map_err(|e| AuthError::invalid_public_key(e.to_string()))?;
    Ok((algorithm, key))
}

fn ed25519_key(jwk: &Jwk) -> Result<(Algorithm, DecodingKey), AuthError> {
    if jwk.crv.as_deref() != Some("Ed25519") {
        return Err(AuthError::invalid_public_key("OKP key must use the Ed25519 curve"));
    }
    if let Some(alg) = jwk.alg.as_deref()
        && alg != "EdDSA"
    {
        return Err(AuthError::invalid_public_key(format!(
            "algorithm '{alg}' is not valid for an Ed25519 key"
        )));
    }
    let x = jwk.x.as_deref().ok_or_else(|| AuthError::invalid_public_key("OKP key is missing x"))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(x)
        .map_err(|e| AuthError::invalid_public_key(format!("base64 decode: {e}")))?;
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        AuthError::invalid_public_key(format!(
            "expected {PUBLIC_KEY_LENGTH} bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| AuthError::invalid_public_key(format!("invalid Ed25519 key: {e}")))?;

    let key = DecodingKey::from_ed_components(x)
        .map_err(|e| AuthError::invalid_public_key(e.to_string()))?;
    Ok((Algorithm::EdDSA, key))
}

/// An immutable snapshot of verification keys, indexed by `kid`.
#[derive(Clone, Debug)]
pub struct KeySet {
    keys: HashMap<String, Arc<SigningKey>>,
    fetched_at: DateTime<Utc>,
}

impl KeySet {
    /// Convert a fetched JWKS document.
    ///
    /// Entries not meant for signatures, without a `kid`, or of an
    /// unsupported type are skipped with a warning. Duplicate `kid`s keep the
    /// first usable entry.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySource`] if no entry is usable.
    pub fn from_jwks(jwks: &JwkSet, fetched_at: DateTime<Utc>) -> Result<Self, AuthError> {
        let mut keys = HashMap::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            if let Some(key_use) = jwk.key_use.as_deref()
                && key_use != "sig"
            {
                tracing::debug!(kid = ?jwk.kid, key_use, "skipping non-signature JWK");
                continue;
            }
            match SigningKey::from_jwk(jwk, fetched_at) {
                Ok(key) => {
                    if keys.contains_key(&key.kid) {
                        tracing::warn!(kid = %key.kid, "duplicate kid in JWKS, keeping first");
                        continue;
                    }
                    keys.insert(key.kid.clone(), Arc::new(key));
                },
                Err(err) => {
                    tracing::warn!(kid = ?jwk.kid, kty = %jwk.kty, error = %err, "skipping unusable JWK");
                },
            }
        }

        if keys.is_empty() {
            return Err(AuthError::key_source("JWKS contains no usable signing keys"));
        }
        Ok(Self { keys, fetched_at })
    }

    /// Carry over keys that vanished from the source, for at most `grace`
    /// after they were first seen missing.
    ///
    /// Keys present in `self` always win over entries in `previous`.
    #[must_use]
    pub fn retain_retired(mut self, previous: &KeySet, now: DateTime<Utc>, grace: Duration) -> Self {
        let grace = chrono::TimeDelta::from_std(grace).unwrap_or(chrono::TimeDelta::MAX);
        for (kid, old) in &previous.keys {
            if self.keys.contains_key(kid) {
                continue;
            }
            let retired_at = old.retired_at.unwrap_or(now);
            if now.signed_duration_since(retired_at) >= grace {
                tracing::info!(kid = %kid, "retired signing key grace period elapsed, dropping");
                continue;
            }
            if old.retired_at.is_none() {
                tracing::info!(kid = %kid, "signing key removed from source, retaining during grace period");
            }
            let mut retained = SigningKey::clone(old);
            retained.retired_at = Some(retired_at);
            self.keys.insert(kid.clone(), Arc::new(retained));
        }
        self
    }

    /// Look up a key by identifier.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&Arc<SigningKey>> {
        self.keys.get(kid)
    }

    /// When this set was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set is empty. Sets built by [`from_jwks`](Self::from_jwks) never are.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key identifiers, sorted.
    #[must_use]
    pub fn kids(&self) -> Vec<&str> {
        let mut kids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        kids.sort_unstable();
        kids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::testutil::{RSA_TEST_EXPONENT, RSA_TEST_MODULUS, generate_keypair, jwk_for, rsa_jwk};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_ed25519_jwk() {
        let (_, public) = generate_keypair();
        let key = SigningKey::from_jwk(&jwk_for("ed-1", &public), t0()).unwrap();
        assert_eq!(key.kid, "ed-1");
        assert_eq!(key.algorithm, Algorithm::EdDSA);
        assert_eq!(key.fetched_at, t0());
        assert!(key.retired_at.is_none());
    }

    #[rstest]
    #[case(None, Algorithm::RS256)]
    #[case(Some("RS256"), Algorithm::RS256)]
    #[case(Some("RS384"), Algorithm::RS384)]
    #[case(Some("RS512"), Algorithm::RS512)]
    fn test_rsa_jwk_algorithm(#[case] alg: Option<&str>, #[case] expected: Algorithm) {
        let mut jwk = rsa_jwk("rsa-1");
        jwk.alg = alg.map(str::to_owned);
        assert_eq!(SigningKey::from_jwk(&jwk, t0()).unwrap().algorithm, expected);
    }

    #[rstest]
    #[case::rsa_with_eddsa("RSA", Some("EdDSA"))]
    #[case::rsa_with_hmac("RSA", Some("HS256"))]
    #[case::okp_with_rsa("OKP", Some("RS256"))]
    fn test_algorithm_must_fit_key_type(#[case] kty: &str, #[case] alg: Option<&str>) {
        let mut jwk = if kty == "RSA" {
            rsa_jwk("k")
        } else {
            let (_, public) = generate_keypair();
            jwk_for("k", &public)
        };
        jwk.alg = alg.map(str::to_owned);
        assert!(matches!(SigningKey::from_jwk(&jwk, t0()), Err(AuthError::InvalidPublicKey { .. })));
    }

    #[test]
    fn test_short_rsa_modulus_rejected() {
        let jwk = Jwk {
            kty: "RSA".into(),
            kid: Some("weak".into()),
            n: Some(URL_SAFE_NO_PAD.encode([0xC5u8; 128])),
            e: Some(RSA_TEST_EXPONENT.into()),
            ..Jwk::default()
        };
        let err = SigningKey::from_jwk(&jwk, t0()).unwrap_err();
        assert!(err.to_string().contains("2048"));
    }

    #[rstest]
    #[case::empty("")]
    #[case::short("AAAA")]
    #[case::not_base64("!!!not-base64!!!")]
    fn test_invalid_ed25519_material(#[case] x: &str) {
        let jwk = Jwk {
            kty: "OKP".into(),
            kid: Some("bad".into()),
            crv: Some("Ed25519".into()),
            x: Some(x.into()),
            ..Jwk::default()
        };
        assert!(matches!(SigningKey::from_jwk(&jwk, t0()), Err(AuthError::InvalidPublicKey { .. })));
    }

    #[test]
    fn test_key_set_skips_unusable_entries() {
        let (_, public) = generate_keypair();
        let mut enc = jwk_for("enc", &public);
        enc.key_use = Some("enc".into());
        let mut no_kid = jwk_for("x", &public);
        no_kid.kid = None;
        let ec = Jwk { kty: "EC".into(), kid: Some("ec".into()), ..Jwk::default() };

        let jwks = JwkSet { keys: vec![enc, no_kid, ec, jwk_for("good", &public), rsa_jwk("rsa")] };
        let set = KeySet::from_jwks(&jwks, t0()).unwrap();
        assert_eq!(set.kids(), vec!["good", "rsa"]);
        assert_eq!(set.fetched_at(), t0());
    }

    #[test]
    fn test_key_set_without_usable_keys_is_error() {
        let ec = Jwk { kty: "EC".into(), kid: Some("ec".into()), ..Jwk::default() };
        let result = KeySet::from_jwks(&JwkSet { keys: vec![ec] }, t0());
        assert!(matches!(result, Err(AuthError::KeySource { .. })));
        assert!(KeySet::from_jwks(&JwkSet::default(), t0()).is_err());
    }

    #[test]
    fn test_retain_retired_grace() {
        let (_, a) = generate_keypair();
        let (_, b) = generate_keypair();
        let grace = Duration::from_secs(600);

        let old = KeySet::from_jwks(&JwkSet { keys: vec![jwk_for("a", &a), jwk_for("b", &b)] }, t0())
            .unwrap();

        // "a" vanishes from the source
        let t1 = t0() + chrono::TimeDelta::seconds(60);
        let next = KeySet::from_jwks(&JwkSet { keys: vec![jwk_for("b", &b)] }, t1).unwrap();
        let merged = next.retain_retired(&old, t1, grace);
        assert_eq!(merged.kids(), vec!["a", "b"]);
        assert_eq!(merged.get("a").unwrap().retired_at, Some(t1));
        assert!(merged.get("b").unwrap().retired_at.is_none());

        // still inside grace: retirement time is preserved, not reset
        let t2 = t1 + chrono::TimeDelta::seconds(599);
        let again = KeySet::from_jwks(&JwkSet { keys: vec![jwk_for("b", &b)] }, t2).unwrap();
        let merged2 = again.retain_retired(&merged, t2, grace);
        assert_eq!(merged2.get("a").unwrap().retired_at, Some(t1));

        // grace elapsed
        let t3 = t1 + chrono::TimeDelta::seconds(600);
        let last = KeySet::from_jwks(&JwkSet { keys: vec![jwk_for("b", &b)] }, t3).unwrap();
        assert_eq!(last.retain_retired(&merged2, t3, grace).kids(), vec!["b"]);
    }

    #[test]
    fn test_jwks_wire_format() {
        let doc = serde_json::json!({
            "keys": [{ "kty": "RSA", "kid": "r1", "use": "sig", "alg": "RS256",
                       "n": RSA_TEST_MODULUS, "e": RSA_TEST_EXPONENT, "x5c": ["ignored"] }]
        });
        let jwks: JwkSet = serde_json::from_value(doc).unwrap();
        assert_eq!(jwks.keys[0].key_use.as_deref(), Some("sig"));
        assert_eq!(KeySet::from_jwks(&jwks, t0()).unwrap().len(), 1);
    }
}
