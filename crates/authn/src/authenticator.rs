//! Request authentication: bearer tokens, and an explicitly lower-trust
//! development bypass.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, header::AUTHORIZATION};
use serde::Serialize;

use crate::{
    claims::Claims,
    config::{DevBypassConfig, TrustMode},
    error::{AuthError, ConfigError},
    validator::TokenValidator,
};

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "trust", rename_all = "snake_case")]
pub enum Principal {
    /// Caller presented a valid bearer token.
    Token(Claims),
    /// Caller named itself through the development bypass headers.
    Development {
        /// User named by the bypass header.
        user: String,
        /// Granted roles.
        roles: BTreeSet<String>,
    },
}

impl Principal {
    /// Subject or bypass user name.
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::Token(claims) => &claims.sub,
            Self::Development { user, .. } => user,
        }
    }

    /// Granted scopes or roles.
    #[must_use]
    pub fn scopes(&self) -> &BTreeSet<String> {
        match self {
            Self::Token(claims) => &claims.scopes,
            Self::Development { roles, .. } => roles,
        }
    }

    /// Whether `scope` was granted.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().contains(scope)
    }

    /// `"token"` or `"development"`.
    #[must_use]
    pub fn trust_level(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Development { .. } => "development",
        }
    }

    /// Whether this principal came from the bypass.
    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development { .. })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
///
/// The scheme is matched case-insensitively.
///
/// # Errors
///
/// Returns [`AuthError::InvalidTokenFormat`] for non-ASCII values, other
/// schemes, or an empty token.
pub fn bearer_token(value: &HeaderValue) -> Result<&str, AuthError> {
    let value = value
        .to_str()
        .map_err(|_| AuthError::invalid_token_format("Authorization header is not valid ASCII"))?;
    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| AuthError::invalid_token_format("expected 'Bearer <token>'"))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::invalid_token_format("Authorization scheme must be Bearer"));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::invalid_token_format("empty bearer token"));
    }
    Ok(token)
}

#[derive(Debug, Clone)]
struct DevBypass {
    user_header: HeaderName,
    roles_header: HeaderName,
    default_roles: BTreeSet<String>,
}

/// Turns request headers into a [`Principal`].
#[derive(Debug, Clone)]
pub struct Authenticator {
    validator: TokenValidator,
    trust_mode: TrustMode,
    dev_bypass: Option<DevBypass>,
}

impl Authenticator {
    /// Creates an authenticator.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InsecureDevelopmentBypass`] if the bypass is enabled
    ///   under [`TrustMode::Production`].
    /// - [`ConfigError::InvalidValue`] if a bypass header name is invalid.
    pub fn new(
        validator: TokenValidator,
        trust_mode: TrustMode,
        dev_bypass: DevBypassConfig,
    ) -> Result<Self, ConfigError> {
        if !dev_bypass.enabled {
            return Ok(Self { validator, trust_mode, dev_bypass: None });
        }
        if trust_mode == TrustMode::Production {
            tracing::error!("refusing to enable the development bypass in production trust mode");
            return Err(ConfigError::InsecureDevelopmentBypass);
        }

        let header = |field: &str, name: &str| {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConfigError::invalid(field, format!("'{name}': {e}")))
        };
        let bypass = DevBypass {
            user_header: header("dev_bypass.user_header", &dev_bypass.user_header)?,
            roles_header: header("dev_bypass.roles_header", &dev_bypass.roles_header)?,
            default_roles: dev_bypass.default_roles.into_iter().collect(),
        };
        tracing::warn!(
            user_header = %bypass.user_header,
            "development authentication bypass is enabled"
        );
        Ok(Self { validator, trust_mode, dev_bypass: Some(bypass) })
    }

    /// The trust mode.
    #[must_use]
    pub fn trust_mode(&self) -> TrustMode {
        self.trust_mode
    }

    /// The token validator.
    #[must_use]
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Authenticate a request from its headers as of `now`.
    ///
    /// A present `Authorization` header is always validated as a bearer
    /// token; the bypass is consulted only when it is absent.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCredentials`] when nothing usable was
    /// presented, or the validator's rejection.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<Principal, AuthError> {
        if let Some(value) = headers.get(AUTHORIZATION) {
            let token = bearer_token(value)?;
            let claims = self.validator.validate(token, now).await?;
            return Ok(Principal::Token(claims));
        }

        self.development_principal(headers).ok_or(AuthError::MissingCredentials)
    }

    fn development_principal(&self, headers: &HeaderMap) -> Option<Principal> {
        let bypass = self.dev_bypass.as_ref()?;
        let user = headers
            .get(&bypass.user_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|u| !u.is_empty())?
            .to_owned();

        let mut roles: BTreeSet<String> = headers
            .get(&bypass.roles_header)
            .and_then(|v| v.to_str().ok())
            .map(|raw| {
                raw.split(',').map(str::trim).filter(|r| !r.is_empty()).map(str::to_owned).collect()
            })
            .unwrap_or_default();
        if roles.is_empty() {
            roles.clone_from(&bypass.default_roles);
        }

        tracing::warn!(
            audit.action = "dev_bypass_authenticated",
            user = %user,
            roles = ?roles,
            "request authenticated through development bypass"
        );
        Some(Principal::Development { user, roles })
    }
}
