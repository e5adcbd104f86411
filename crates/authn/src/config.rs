//! Configuration for token validation, the key cache, webhooks and the
//! development bypass.
//!
//! Every type deserializes with `deny_unknown_fields` and human-readable
//! durations (`"5m"`, `"30s"`). Types that carry cross-field invariants are
//! constructed through a validating builder and expose `validate()` for
//! values that arrived through serde.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default clock-skew leeway (60 seconds).
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(60);

/// Largest leeway accepted. More than this stops being skew tolerance.
pub const MAX_LEEWAY: Duration = Duration::from_secs(300);

/// Default key-set freshness window (5 minutes).
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(300);

/// Default hard staleness ceiling (1 hour).
pub const DEFAULT_MAX_STALENESS: Duration = Duration::from_secs(3600);

/// Default background refresh interval (60 seconds).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Default minimum spacing between unknown-`kid` forced refreshes.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Default bound on a single key-set fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default webhook acceptance window (5 minutes).
pub const DEFAULT_ACCEPTANCE_WINDOW: Duration = Duration::from_secs(300);

/// Default extra retention for replay entries beyond the acceptance window.
pub const DEFAULT_REPLAY_MARGIN: Duration = Duration::from_secs(30);

/// Default bound on a replay-store round trip.
pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(2);

/// Claims policy for bearer tokens.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use corpdir_authn::config::TokenConfig;
///
/// let config = TokenConfig::builder()
///     .issuer("https://idp.example.com/realms/corp")
///     .audiences(["corpdir-api"])
///     .leeway(Duration::from_secs(30))
///     .build()?;
/// assert!(config.audiences().contains("corpdir-api"));
/// # Ok::<(), corpdir_authn::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    pub(crate) issuer: String,
    pub(crate) audiences: BTreeSet<String>,
    #[serde(with = "humantime_serde", default = "default_leeway")]
    pub(crate) leeway: Duration,
    #[serde(with = "humantime_serde", default)]
    pub(crate) max_token_age: Option<Duration>,
    #[serde(default)]
    pub(crate) accept_authorized_party: bool,
}

fn default_leeway() -> Duration {
    DEFAULT_LEEWAY
}

#[bon::bon]
impl TokenConfig {
    /// Creates a validated token policy.
    ///
    /// # Arguments
    ///
    /// * `issuer` - Exact `iss` value tokens must carry.
    /// * `audiences` - Accepted audiences. A token passes if any of its `aud` entries is listed.
    ///
    /// # Optional Fields
    ///
    /// * `leeway` - Clock-skew tolerance (default: 60 seconds, at most 5 minutes).
    /// * `max_token_age` - Reject tokens issued longer ago than this.
    /// * `accept_authorized_party` - Also accept a token whose `azp` is a listed audience.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the issuer or audience list is empty or the
    /// leeway exceeds [`MAX_LEEWAY`].
    #[builder]
    pub fn new(
        #[builder(into)] issuer: String,
        #[builder(with = |iter: impl IntoIterator<Item = impl Into<String>>| {
            iter.into_iter().map(Into::into).collect()
        })]
        audiences: BTreeSet<String>,
        #[builder(default = DEFAULT_LEEWAY)] leeway: Duration,
        max_token_age: Option<Duration>,
        #[builder(default)] accept_authorized_party: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self { issuer, audiences, leeway, max_token_age, accept_authorized_party };
        config.validate()?;
        Ok(config)
    }

    /// Re-check invariants, e.g. after deserialization.
    ///
    /// # Errors
    ///
    /// See [`TokenConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::missing("issuer"));
        }
        if self.audiences.iter().all(|a| a.trim().is_empty()) {
            return Err(ConfigError::missing("audiences"));
        }
        if self.leeway > MAX_LEEWAY {
            return Err(ConfigError::invalid(
                "leeway",
                format!("{}s exceeds the {}s maximum", self.leeway.as_secs(), MAX_LEEWAY.as_secs()),
            ));
        }
        Ok(())
    }

    /// Expected issuer.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Accepted audiences.
    #[must_use]
    pub fn audiences(&self) -> &BTreeSet<String> {
        &self.audiences
    }

    /// Clock-skew leeway.
    #[must_use]
    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    /// Maximum token age, if enforced.
    #[must_use]
    pub fn max_token_age(&self) -> Option<Duration> {
        self.max_token_age
    }

    /// Whether `azp` may stand in for `aud`.
    #[must_use]
    pub fn accept_authorized_party(&self) -> bool {
        self.accept_authorized_party
    }
}

/// What happens to keys that disappear from the key source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RotationPolicy {
    /// The fetched set replaces the cached set as a whole.
    #[default]
    ReplaceWholesale,
    /// Removed keys stay verifiable for `grace` after they were first
    /// observed missing.
    RetainRetired {
        /// How long a retired key stays usable.
        #[serde(with = "humantime_serde")]
        grace: Duration,
    },
}

/// Key cache timing.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyCacheConfig {
    /// Age up to which the cached set is served without a refresh.
    #[serde(with = "humantime_serde", default = "default_freshness_window")]
    #[builder(default = DEFAULT_FRESHNESS_WINDOW)]
    pub freshness_window: Duration,

    /// Age beyond which the cached set is never served, even as a fallback.
    #[serde(with = "humantime_serde", default = "default_max_staleness")]
    #[builder(default = DEFAULT_MAX_STALENESS)]
    pub max_staleness: Duration,

    /// Background refresh period.
    #[serde(with = "humantime_serde", default = "default_refresh_interval")]
    #[builder(default = DEFAULT_REFRESH_INTERVAL)]
    pub refresh_interval: Duration,

    /// Minimum spacing between refreshes forced by an unknown `kid`.
    #[serde(with = "humantime_serde", default = "default_min_refresh_interval")]
    #[builder(default = DEFAULT_MIN_REFRESH_INTERVAL)]
    pub min_refresh_interval: Duration,

    /// Bound on one fetch from the key source.
    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    #[builder(default = DEFAULT_FETCH_TIMEOUT)]
    pub fetch_timeout: Duration,

    /// Rotation policy.
    #[serde(default)]
    #[builder(default)]
    pub rotation: RotationPolicy,
}

fn default_freshness_window() -> Duration {
    DEFAULT_FRESHNESS_WINDOW
}

fn default_max_staleness() -> Duration {
    DEFAULT_MAX_STALENESS
}

fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

fn default_min_refresh_interval() -> Duration {
    DEFAULT_MIN_REFRESH_INTERVAL
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl KeyCacheConfig {
    /// Check cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the staleness ceiling is
    /// below the freshness window or any interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_staleness < self.freshness_window {
            return Err(ConfigError::invalid(
                "max_staleness",
                "must be at least the freshness window",
            ));
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::invalid("fetch_timeout", "must be non-zero"));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::invalid("refresh_interval", "must be non-zero"));
        }
        Ok(())
    }
}

/// Webhook verification settings.
///
/// `secrets` maps a source identifier to one or more hex-encoded shared
/// secrets. Listing two secrets for a source lets the sender rotate without
/// a flag day.
#[derive(Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// Source → hex-encoded secrets.
    #[serde(default)]
    #[builder(default)]
    pub secrets: BTreeMap<String, Vec<String>>,

    /// Symmetric acceptance window around the declared timestamp.
    #[serde(with = "humantime_serde", default = "default_acceptance_window")]
    #[builder(default = DEFAULT_ACCEPTANCE_WINDOW)]
    pub acceptance_window: Duration,

    /// Extra retention for replay entries beyond the window.
    #[serde(with = "humantime_serde", default = "default_replay_margin")]
    #[builder(default = DEFAULT_REPLAY_MARGIN)]
    pub replay_margin: Duration,

    /// Bound on one replay-store round trip.
    #[serde(with = "humantime_serde", default = "default_replay_timeout")]
    #[builder(default = DEFAULT_REPLAY_TIMEOUT)]
    pub replay_timeout: Duration,
}

fn default_acceptance_window() -> Duration {
    DEFAULT_ACCEPTANCE_WINDOW
}

fn default_replay_margin() -> Duration {
    DEFAULT_REPLAY_MARGIN
}

fn default_replay_timeout() -> Duration {
    DEFAULT_REPLAY_TIMEOUT
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources: BTreeMap<&str, usize> =
            self.secrets.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("WebhookConfig")
            .field("secrets", &sources)
            .field("acceptance_window", &self.acceptance_window)
            .field("replay_margin", &self.replay_margin)
            .field("replay_timeout", &self.replay_timeout)
            .finish()
    }
}

impl WebhookConfig {
    /// Retention for a replay entry: window plus margin.
    #[must_use]
    pub fn replay_retention(&self) -> Duration {
        self.acceptance_window.saturating_add(self.replay_margin)
    }

    /// Parse the `source=hex[,hex...];source2=hex` form used by environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for entries without `=`, empty
    /// source names, or sources without secrets.
    pub fn parse_secrets(raw: &str) -> Result<BTreeMap<String, Vec<String>>, ConfigError> {
        let mut secrets = BTreeMap::new();
        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((source, list)) = entry.split_once('=') else {
                return Err(ConfigError::invalid("webhook_secrets", "expected source=hex[,hex]"));
            };
            let source = source.trim();
            if source.is_empty() {
                return Err(ConfigError::invalid("webhook_secrets", "empty source name"));
            }
            let list: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
            if list.is_empty() {
                return Err(ConfigError::invalid(
                    "webhook_secrets",
                    format!("source '{source}' has no secrets"),
                ));
            }
            secrets.entry(source.to_owned()).or_insert_with(Vec::new).extend(list);
        }
        Ok(secrets)
    }
}

/// Trust level the service runs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustMode {
    /// Only verified bearer tokens are accepted.
    #[default]
    Production,
    /// The development bypass may be enabled.
    Development,
}

impl FromStr for TrustMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(ConfigError::invalid("trust_mode", format!("unknown mode '{other}'"))),
        }
    }
}

impl fmt::Display for TrustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Development => "development",
        })
    }
}

/// Development bypass: a trusted header naming the user.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevBypassConfig {
    /// Whether the bypass is enabled at all.
    #[serde(default)]
    #[builder(default)]
    pub enabled: bool,

    /// Header carrying the user identifier.
    #[serde(default = "default_user_header")]
    #[builder(into, default = default_user_header())]
    pub user_header: String,

    /// Header carrying comma-separated roles.
    #[serde(default = "default_roles_header")]
    #[builder(into, default = default_roles_header())]
    pub roles_header: String,

    /// Roles granted when the roles header is absent.
    #[serde(default = "default_roles")]
    #[builder(default = default_roles())]
    pub default_roles: Vec<String>,
}

fn default_user_header() -> String {
    "x-dev-user".to_owned()
}

fn default_roles_header() -> String {
    "x-dev-roles".to_owned()
}

fn default_roles() -> Vec<String> {
    vec!["directory.read".to_owned()]
}

impl Default for DevBypassConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_token_config_defaults() {
        let config = TokenConfig::builder().issuer("sut").audiences(["sut-api"]).build().unwrap();
        assert_eq!(config.issuer(), "sut");
        assert_eq!(config.leeway(), DEFAULT_LEEWAY);
        assert!(config.max_token_age().is_none());
        assert!(!config.accept_authorized_party());
    }

    #[test]
    fn test_token_config_rejects_empty_issuer() {
        let result = TokenConfig::builder().issuer("  ").audiences(["a"]).build();
        assert!(matches!(result, Err(ConfigError::MissingField { ref field }) if field == "issuer"));
    }

    #[test]
    fn test_token_config_rejects_empty_audiences() {
        let result = TokenConfig::builder().issuer("sut").audiences(Vec::<String>::new()).build();
        assert!(matches!(result, Err(ConfigError::MissingField { ref field }) if field == "audiences"));
    }

    #[test]
    fn test_token_config_rejects_excessive_leeway() {
        let result = TokenConfig::builder()
            .issuer("sut")
            .audiences(["a"])
            .leeway(MAX_LEEWAY + Duration::from_secs(1))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_token_config_deserialize() {
        let config: TokenConfig = serde_json::from_str(
            r#"{"issuer":"sut","audiences":["a","b"],"leeway":"30s","max_token_age":"1h"}"#,
        )
        .unwrap();
        assert_eq!(config.leeway(), Duration::from_secs(30));
        assert_eq!(config.max_token_age(), Some(Duration::from_secs(3600)));
        config.validate().unwrap();

        let unknown = serde_json::from_str::<TokenConfig>(r#"{"issuer":"s","audiences":[],"x":1}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn test_key_cache_config_defaults_are_valid() {
        let config = KeyCacheConfig::default();
        assert_eq!(config.freshness_window, DEFAULT_FRESHNESS_WINDOW);
        assert_eq!(config.max_staleness, DEFAULT_MAX_STALENESS);
        assert_eq!(config.rotation, RotationPolicy::ReplaceWholesale);
        config.validate().unwrap();
    }

    #[test]
    fn test_key_cache_config_staleness_below_freshness() {
        let config = KeyCacheConfig::builder()
            .freshness_window(Duration::from_secs(600))
            .max_staleness(Duration::from_secs(60))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rotation_policy_serde() {
        let policy: RotationPolicy =
            serde_json::from_str(r#"{"policy":"retain_retired","grace":"10m"}"#).unwrap();
        assert_eq!(policy, RotationPolicy::RetainRetired { grace: Duration::from_secs(600) });

        let config: KeyCacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, KeyCacheConfig::default());
    }

    #[test]
    fn test_parse_secrets() {
        let parsed = WebhookConfig::parse_secrets("crm-x=aa11,bb22; hr=cc33;").unwrap();
        assert_eq!(parsed["crm-x"], vec!["aa11", "bb22"]);
        assert_eq!(parsed["hr"], vec!["cc33"]);
        assert!(WebhookConfig::parse_secrets("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_secrets_errors() {
        assert!(WebhookConfig::parse_secrets("no-equals").is_err());
        assert!(WebhookConfig::parse_secrets("=aa").is_err());
        assert!(WebhookConfig::parse_secrets("src=,").is_err());
    }

    #[test]
    fn test_webhook_debug_redacts_secrets() {
        let config = WebhookConfig::builder()
            .secrets(BTreeMap::from([("crm-x".to_owned(), vec!["deadbeef".to_owned()])]))
            .build();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("deadbeef"));
        assert!(rendered.contains("crm-x"));
        assert_eq!(config.replay_retention(), Duration::from_secs(330));
    }

    #[test]
    fn test_trust_mode_parse() {
        assert_eq!("production".parse::<TrustMode>().unwrap(), TrustMode::Production);
        assert_eq!("DEV".parse::<TrustMode>().unwrap(), TrustMode::Development);
        assert!("staging".parse::<TrustMode>().is_err());
        assert_eq!(TrustMode::default(), TrustMode::Production);
    }

    #[test]
    fn test_dev_bypass_defaults() {
        let config = DevBypassConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.user_header, "x-dev-user");
        assert_eq!(config.default_roles, vec!["directory.read"]);
    }
}
