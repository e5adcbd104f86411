//! Content-derived version tokens.
//!
//! A [`VersionToken`] is the lowercase hex SHA-256 of a resource's canonical
//! JSON encoding. Two processes holding the same state compute the same
//! token without talking to each other, and the token changes exactly when
//! the observable state does.
//!
//! Canonical means: object keys sorted, no insignificant whitespace. Keys are
//! sorted explicitly so the encoding does not depend on how `serde_json`'s
//! map type is configured elsewhere in the build.

use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{ConcurrencyError, Result};

/// Opaque version of a resource's state.
///
/// Compared byte-for-byte; never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionToken(String);

impl VersionToken {
    /// Token for `state`.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyError::Serialization`] if `state` cannot be
    /// represented as JSON.
    pub fn of<T: Serialize>(state: &T) -> Result<Self> {
        Ok(Self::from_canonical_bytes(&canonical_bytes(state)?))
    }

    /// Token for bytes already in canonical form, such as a stored record.
    #[must_use]
    pub fn from_canonical_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Interpret an `If-Match` header value.
    ///
    /// Returns `None` for an empty value or `*`: neither names a version,
    /// and a mutation without one is a distinct caller error. Surrounding
    /// quotes are stripped and nothing else is normalised, so a weak tag
    /// (`W/"..."`) keeps its prefix and never matches a current version.
    #[must_use]
    pub fn from_if_match(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value == "*" {
            return None;
        }
        let unquoted = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        Some(Self(unquoted.to_owned()))
    }

    /// Quoted strong entity tag for an `ETag` header.
    #[must_use]
    pub fn to_etag(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// The bare token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for VersionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Canonical JSON encoding of `state`: sorted object keys, compact.
///
/// # Errors
///
/// Returns [`ConcurrencyError::Serialization`] if `state` cannot be
/// represented as JSON.
pub fn canonical_bytes<T: Serialize>(state: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(state)
        .map_err(|e| ConcurrencyError::serialization("encode resource state", e))?;
    serde_json::to_vec(&sort_keys(value))
        .map_err(|e| ConcurrencyError::serialization("encode resource state", e))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let sorted: Map<String, Value> =
                entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(sorted)
        },
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
