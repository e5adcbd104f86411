//! Shared test utilities for authentication testing.
//!
//! Helpers for generating Ed25519 key pairs, publishing them as JWKs,
//! signing tokens (EdDSA and RS256/384/512), crafting raw tokens for attack
//! tests, scripting a key source, and signing webhook bodies. Feature-gated
//! behind `testutil` so none of it reaches production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! corpdir-authn = { workspace = true, features = ["testutil"] }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use rand_core::OsRng;
use serde_json::{Value, json};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    config::{KeyCacheConfig, TokenConfig},
    error::AuthError,
    jwks::{Jwk, JwkSet},
    key_cache::KeyCache,
    key_source::KeySource,
    validator::TokenValidator,
};

/// Issuer used by [`standard_claims`] and [`test_token_config`].
pub const TEST_ISSUER: &str = "sut";

/// Audience used by [`standard_claims`] and [`test_token_config`].
pub const TEST_AUDIENCE: &str = "sut-api";

/// 2048-bit RSA test key (PKCS#1 PEM). Never use outside tests.
pub const RSA_TEST_PRIVATE_PEM: &str = include_str!("../tests/fixtures/rsa_test_key.pem");

/// Modulus of [`RSA_TEST_PRIVATE_PEM`], base64url.
pub const RSA_TEST_MODULUS: &str = "z2Odpc3pQeLpi5-m3V7y4rprpeR4eecNASo5tNwpmyKcluv1UYiJyowNvQ6G3_BxRfiUHpzqws0d4vvbiHuyc9pqGuDI3jiAA-C1rr_EuJn9i-MeevAour2mtkfQuvHUnKM1yY-pmq1ZjL6zdZGL7wRwBg_BhfzgARcy29FZkruEAEweFHEjFXH2c111CB3VXfhf-fshwvsAHQo7ePbB8_OiVOh_cpVRCyOnL6Yk7az4qwoWrvhmY_N_kLL9sIcWzEqLG_lrPslKt8pLBQCPTW94ADXtfrOJgS6KUfo6R2eOhNBPENDV9EmPzA66dn5rVCeuF2gqiIxHpzMGZ8ePEQ";

/// Public exponent of [`RSA_TEST_PRIVATE_PEM`] (65537), base64url.
pub const RSA_TEST_EXPONENT: &str = "AQAB";

/// Generates an Ed25519 key pair.
///
/// Returns `(pkcs8_der, public_key_base64url)`; the DER is suitable for
/// [`EncodingKey::from_ed_der`], the public key for a JWK `x` member.
pub fn generate_keypair() -> (Zeroizing<Vec<u8>>, String) {
    let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
    let public_key_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

    let private_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
    let mut pkcs8_der = Zeroizing::new(vec![
        0x30, 0x2e, // SEQUENCE, 46 bytes
        0x02, 0x01, 0x00, // INTEGER version 0
        0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
        0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
        0x04, 0x22, // OCTET STRING, 34 bytes
        0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
    ]);
    pkcs8_der.extend_from_slice(&*private_bytes);

    (pkcs8_der, public_key_b64)
}

/// An OKP/Ed25519 JWK for `public_key_b64`.
#[must_use]
pub fn jwk_for(kid: &str, public_key_b64: &str) -> Jwk {
    Jwk {
        kty: "OKP".into(),
        kid: Some(kid.into()),
        alg: Some("EdDSA".into()),
        key_use: Some("sig".into()),
        crv: Some("Ed25519".into()),
        x: Some(public_key_b64.into()),
        ..Jwk::default()
    }
}

/// An RSA JWK for the built-in test key.
#[must_use]
pub fn rsa_jwk(kid: &str) -> Jwk {
    Jwk {
        kty: "RSA".into(),
        kid: Some(kid.into()),
        key_use: Some("sig".into()),
        n: Some(RSA_TEST_MODULUS.into()),
        e: Some(RSA_TEST_EXPONENT.into()),
        ..Jwk::default()
    }
}

/// Claims that pass [`test_token_config`] at `now` (seconds since epoch).
///
/// Valid for 60 seconds, with scopes `directory.read directory.write`.
#[must_use]
pub fn standard_claims(now: i64) -> Value {
    json!({
        "iss": TEST_ISSUER,
        "sub": "user-1",
        "aud": TEST_AUDIENCE,
        "exp": now + 60,
        "iat": now,
        "scope": "directory.read directory.write",
    })
}

/// Token policy matching [`standard_claims`], with the default leeway.
///
/// # Panics
///
/// Never in practice; the values are valid.
#[must_use]
pub fn test_token_config() -> TokenConfig {
    TokenConfig::builder()
        .issuer(TEST_ISSUER)
        .audiences([TEST_AUDIENCE])
        .build()
        .expect("static token config is valid")
}

/// Signs `claims` with an Ed25519 key in PKCS#8 DER, with `kid` in the header.
///
/// # Panics
///
/// Panics if encoding fails.
pub fn sign_token(pkcs8_der: &[u8], kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(kid.to_owned());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_ed_der(pkcs8_der))
        .expect("Failed to encode test JWT")
}

/// Signs `claims` with the built-in RSA test key.
///
/// # Panics
///
/// Panics if `algorithm` is not an RSA algorithm or encoding fails.
pub fn sign_rsa_token(algorithm: Algorithm, kid: &str, claims: &Value) -> String {
    let key = EncodingKey::from_rsa_pem(RSA_TEST_PRIVATE_PEM.as_bytes()).expect("test RSA key");
    let mut header = Header::new(algorithm);
    header.kid = Some(kid.to_owned());
    jsonwebtoken::encode(&header, claims, &key).expect("Failed to encode test JWT")
}

/// Builds a token from arbitrary header and payload JSON with a bogus
/// signature segment, for attack tests (`alg: none`, algorithm confusion,
/// missing `kid`).
///
/// # Panics
///
/// Panics if JSON serialization fails.
pub fn craft_raw_jwt(header_json: &Value, payload_json: &Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    let signature_b64 = URL_SAFE_NO_PAD.encode([0u8; 64]);
    format!("{header_b64}.{payload_b64}.{signature_b64}")
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
///
/// # Panics
///
/// Never in practice; HMAC accepts any key length.
#[must_use]
pub fn sign_webhook(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// A scriptable in-memory [`KeySource`].
///
/// Counts fetches, can be told to fail, and can be slowed down to exercise
/// timeouts and single-flight behavior.
#[derive(Debug, Default)]
pub struct StaticKeySource {
    jwks: Mutex<JwkSet>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    fetches: AtomicU64,
}

impl StaticKeySource {
    /// Serves `jwks` until changed.
    #[must_use]
    pub fn new(jwks: JwkSet) -> Self {
        Self { jwks: Mutex::new(jwks), ..Self::default() }
    }

    /// Replace the published set.
    pub fn set_keys(&self, jwks: JwkSet) {
        *self.jwks.lock() = jwks;
    }

    /// Make subsequent fetches fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay each fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Fetches started so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthError::key_source("static key source unavailable"));
        }
        Ok(self.jwks.lock().clone())
    }
}

/// A token issuer with one Ed25519 key, published through a
/// [`StaticKeySource`].
pub struct TestIssuer {
    /// Key identifier of the signing key.
    pub kid: String,
    /// Source publishing the key.
    pub source: Arc<StaticKeySource>,
    pkcs8_der: Zeroizing<Vec<u8>>,
    public_key: String,
}

impl TestIssuer {
    /// Generates a key and publishes it under `kid`.
    #[must_use]
    pub fn new(kid: &str) -> Self {
        let (pkcs8_der, public_key) = generate_keypair();
        let source = Arc::new(StaticKeySource::new(JwkSet { keys: vec![jwk_for(kid, &public_key)] }));
        Self { kid: kid.to_owned(), source, pkcs8_der, public_key }
    }

    /// The published JWK.
    #[must_use]
    pub fn jwk(&self) -> Jwk {
        jwk_for(&self.kid, &self.public_key)
    }

    /// Signs `claims` with this issuer's key.
    #[must_use]
    pub fn sign(&self, claims: &Value) -> String {
        sign_token(&self.pkcs8_der, &self.kid, claims)
    }

    /// Signs `claims` with this issuer's key but a different `kid` header.
    #[must_use]
    pub fn sign_with_kid(&self, kid: &str, claims: &Value) -> String {
        sign_token(&self.pkcs8_der, kid, claims)
    }

    /// A key cache over this issuer's source.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn key_cache(&self, config: KeyCacheConfig) -> Arc<KeyCache> {
        let source: Arc<dyn KeySource> = self.source.clone();
        Arc::new(KeyCache::new(source, config).expect("valid key cache config"))
    }

    /// A validator with a default key cache over this issuer's source.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn validator(&self, config: TokenConfig) -> TokenValidator {
        TokenValidator::new(config, self.key_cache(KeyCacheConfig::default()))
            .expect("valid token config")
    }
}

/// Asserts that a [`Result<T, AuthError>`] is an `Err` matching the given [`AuthError`] variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use corpdir_authn::assert_auth_error;
/// use corpdir_authn::error::AuthError;
///
/// let result: Result<(), AuthError> = Err(AuthError::token_expired());
/// assert_auth_error!(result, TokenExpired);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}
