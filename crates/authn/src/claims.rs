//! Typed claims extracted from a verified token.
//!
//! The claims the validator checks are explicit fields. Everything else the
//! issuer put in the payload is kept verbatim in [`Claims::extensions`] so
//! downstream authorization can read it without this crate knowing about it.
//!
//! ```json
//! {
//!   "iss": "https://idp.example.com/realms/corp",
//!   "sub": "f1c2d3e4",
//!   "aud": ["corpdir-api", "account"],
//!   "exp": 1700000060,
//!   "iat": 1700000000,
//!   "azp": "corpdir-ui",
//!   "scope": "openid profile",
//!   "realm_access": { "roles": ["directory.read", "directory.write"] }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AuthError;

/// Claims of a token whose signature has been verified.
///
/// Built once by [`TokenValidator`](crate::validator::TokenValidator) and
/// handed out by value; nothing in this crate mutates it afterwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Claims {
    /// Subject.
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Audiences. A single-string `aud` becomes a one-element set.
    pub aud: BTreeSet<String>,
    /// Issued at (seconds since epoch).
    pub iat: i64,
    /// Expiration time (seconds since epoch).
    pub exp: i64,
    /// Not before (seconds since epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Token identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Authorized party (the client the token was issued to).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    /// Union of the space-separated `scope` claim and `realm_access.roles`.
    pub scopes: BTreeSet<String>,
    /// All remaining claims, unchanged.
    pub extensions: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RawClaims {
    sub: Option<String>,
    iss: Option<String>,
    aud: Option<Audience>,
    iat: Option<i64>,
    exp: Option<i64>,
    nbf: Option<i64>,
    jti: Option<String>,
    azp: Option<String>,
    scope: Option<String>,
    #[serde(flatten)]
    extensions: BTreeMap<String, Value>,
}

fn require<T>(value: Option<T>, claim: &str) -> Result<T, AuthError> {
    value.ok_or_else(|| AuthError::missing_claim(claim))
}

fn require_string(value: Option<String>, claim: &str) -> Result<String, AuthError> {
    value.filter(|s| !s.is_empty()).ok_or_else(|| AuthError::missing_claim(claim))
}

impl Claims {
    /// Parse claims from a decoded JWT payload.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidTokenFormat`] if the payload is not a JSON object
    ///   or a known claim has the wrong type.
    /// - [`AuthError::MissingClaim`] if `sub`, `iss`, `exp` or `iat` is absent
    ///   (empty strings count as absent).
    pub fn from_payload(payload: &[u8]) -> Result<Self, AuthError> {
        let raw: RawClaims = serde_json::from_slice(payload).map_err(|e| {
            AuthError::invalid_token_format(format!("Failed to parse JWT claims: {e}"))
        })?;

        let sub = require_string(raw.sub, "sub")?;
        let iss = require_string(raw.iss, "iss")?;
        let exp = require(raw.exp, "exp")?;
        let iat = require(raw.iat, "iat")?;

        let aud = match raw.aud {
            None => BTreeSet::new(),
            Some(Audience::One(a)) => BTreeSet::from([a]),
            Some(Audience::Many(list)) => list.into_iter().collect(),
        };

        let mut scopes: BTreeSet<String> = raw
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        if let Some(roles) = raw
            .extensions
            .get("realm_access")
            .and_then(|ra| ra.get("roles"))
            .and_then(Value::as_array)
        {
            scopes.extend(roles.iter().filter_map(Value::as_str).map(str::to_owned));
        }

        Ok(Self {
            sub,
            iss,
            aud,
            iat,
            exp,
            nbf: raw.nbf,
            jti: raw.jti,
            azp: raw.azp,
            scopes,
            extensions: raw.extensions,
        })
    }

    /// Whether the token grants `scope`, from either `scope` or realm roles.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Look up a claim that has no dedicated field.
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: Value) -> Result<Claims, AuthError> {
        Claims::from_payload(&serde_json::to_vec(&value).unwrap())
    }

    fn minimal() -> Value {
        json!({ "sub": "u1", "iss": "sut", "aud": "sut-api", "exp": 2000, "iat": 1000 })
    }

    #[test]
    fn test_single_string_audience() {
        let claims = parse(minimal()).unwrap();
        assert_eq!(claims.aud, BTreeSet::from(["sut-api".to_owned()]));
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.exp, 2000);
        assert!(claims.scopes.is_empty());
        assert!(claims.extensions.is_empty());
    }

    #[test]
    fn test_array_audience() {
        let mut v = minimal();
        v["aud"] = json!(["a", "b", "a"]);
        let claims = parse(v).unwrap();
        assert_eq!(claims.aud.len(), 2);
        assert!(claims.aud.contains("a"));
    }

    #[test]
    fn test_missing_audience_is_empty_set() {
        let mut v = minimal();
        v.as_object_mut().unwrap().remove("aud");
        assert!(parse(v).unwrap().aud.is_empty());
    }

    #[test]
    fn test_required_claims() {
        for claim in ["sub", "iss", "exp", "iat"] {
            let mut v = minimal();
            v.as_object_mut().unwrap().remove(claim);
            match parse(v) {
                Err(AuthError::MissingClaim { claim: c }) => assert_eq!(c, claim),
                other => panic!("expected MissingClaim({claim}), got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_subject_counts_as_missing() {
        let mut v = minimal();
        v["sub"] = json!("");
        assert!(matches!(parse(v), Err(AuthError::MissingClaim { .. })));
    }

    #[test]
    fn test_wrong_type_is_format_error() {
        let mut v = minimal();
        v["exp"] = json!("tomorrow");
        assert!(matches!(parse(v), Err(AuthError::InvalidTokenFormat { .. })));
        assert!(matches!(
            Claims::from_payload(b"[1,2,3]"),
            Err(AuthError::InvalidTokenFormat { .. })
        ));
    }

    #[test]
    fn test_scopes_merge_scope_claim_and_realm_roles() {
        let mut v = minimal();
        v["scope"] = json!("openid  profile");
        v["realm_access"] = json!({ "roles": ["directory.read", "openid"] });
        let claims = parse(v).unwrap();

        let expected: BTreeSet<String> =
            ["directory.read", "openid", "profile"].into_iter().map(String::from).collect();
        assert_eq!(claims.scopes, expected);
        assert!(claims.has_scope("directory.read"));
        // realm_access stays available verbatim
        assert!(claims.extension("realm_access").is_some());
    }

    #[test]
    fn test_unknown_claims_pass_through() {
        let mut v = minimal();
        v["tenant"] = json!({ "id": 7, "tier": "gold" });
        v["email"] = json!("a@example.com");
        v["azp"] = json!("corpdir-ui");
        let claims = parse(v).unwrap();

        assert_eq!(claims.extension("tenant"), Some(&json!({ "id": 7, "tier": "gold" })));
        assert_eq!(claims.extension("email"), Some(&json!("a@example.com")));
        assert_eq!(claims.azp.as_deref(), Some("corpdir-ui"));
        // modelled claims do not leak into extensions
        assert!(claims.extension("azp").is_none());
        assert!(claims.extension("sub").is_none());
    }
}
