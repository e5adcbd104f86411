//! # corpdir authentication and admission
//!
//! Decides whether an inbound request is authentic and fresh.
//!
//! This crate provides:
//! - **Key cache**: JWKS snapshot with freshness window, staleness ceiling,
//!   single-flight refresh and a background refresher
//! - **Token validation**: signature first, then typed claims checks with
//!   clock-skew leeway
//! - **Authenticator**: `Authorization: Bearer` plus a development bypass
//!   that refuses to run under production trust
//! - **Webhook verification**: HMAC-SHA256 over the raw body, a symmetric
//!   acceptance window, and exactly-once acceptance through a replay guard
//!
//! ## Features
//!
//! - Only asymmetric algorithms (EdDSA, RS256/384/512) are accepted
//! - `none` and HMAC algorithms are rejected before any key lookup
//! - Key-source outages degrade to the last good key set up to a hard
//!   staleness ceiling, then surface as "not ready"
//!
//! ## Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use chrono::Utc;
//! use corpdir_authn::{
//!     HttpKeySource, KeyCache, TokenValidator,
//!     config::{KeyCacheConfig, TokenConfig},
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = Arc::new(HttpKeySource::new(
//!     "https://idp.example.com/realms/corp/protocol/openid-connect/certs",
//!     Duration::from_secs(5),
//! )?);
//! let cache = Arc::new(KeyCache::new(source, KeyCacheConfig::default())?)
//!     .start_background_refresh(Duration::from_secs(60));
//!
//! let config = TokenConfig::builder()
//!     .issuer("https://idp.example.com/realms/corp")
//!     .audiences(["corpdir-api"])
//!     .build()?;
//! let validator = TokenValidator::new(config, cache)?;
//!
//! let claims = validator.validate("eyJhbGciOiJFZERTQSIsImtpZCI6ImsxIn0...", Utc::now()).await?;
//! println!("authenticated {}", claims.sub);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Bearer and development-bypass authentication.
pub mod authenticator;
/// Typed token claims.
pub mod claims;
/// Configuration types.
pub mod config;
/// Error types.
pub mod error;
/// JWKS wire types and verification keys.
pub mod jwks;
/// Signing key cache.
pub mod key_cache;
/// Key sources.
pub mod key_source;
/// Webhook replay guards.
pub mod replay;
/// Header-level algorithm and key-id checks.
pub mod validation;
/// Token validation.
pub mod validator;
/// Webhook verification.
pub mod webhook;

/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use authenticator::{Authenticator, Principal};
pub use claims::Claims;
pub use config::{DevBypassConfig, KeyCacheConfig, RotationPolicy, TokenConfig, TrustMode, WebhookConfig};
pub use error::{AuthError, ConfigError, Result, WebhookError};
pub use jwks::{JwkSet, KeySet, SigningKey};
pub use key_cache::{KeyCache, KeyCacheStatus};
pub use key_source::{HttpKeySource, KeySource};
pub use replay::{InMemoryReplayGuard, ReplayGuard, ReplayStatus, StorageReplayGuard};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
pub use validator::TokenValidator;
pub use webhook::{DeliveryVerdict, WebhookDelivery, WebhookVerifier};
