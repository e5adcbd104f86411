//! Command-line and environment configuration.
//!
//! Every flag has a `CORPDIR_*` environment variable. [`Cli::settings`]
//! turns the raw values into the validated library configuration types, so
//! misconfiguration fails before the listener binds.

use std::{net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};
use corpdir_authn::{
    DevBypassConfig, KeyCacheConfig, RotationPolicy, TokenConfig, TrustMode, WebhookConfig,
    error::ConfigError,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// `corpdir-api` command line.
#[derive(Debug, Clone, Parser)]
#[command(name = "corpdir-api", version, about = "Corporate directory admission layer")]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, env = "CORPDIR_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// JWKS document URL of the identity provider.
    #[arg(long, env = "CORPDIR_JWKS_URL")]
    pub jwks_url: String,

    /// Expected token issuer.
    #[arg(long, env = "CORPDIR_ISSUER")]
    pub issuer: String,

    /// Accepted audiences, comma-separated.
    #[arg(long, env = "CORPDIR_AUDIENCE", value_delimiter = ',', required = true)]
    pub audience: Vec<String>,

    /// Accept a token whose `azp` names an accepted audience.
    #[arg(long, env = "CORPDIR_ACCEPT_AZP", default_value_t = false)]
    pub accept_azp: bool,

    /// Clock-skew leeway for time claims.
    #[arg(long, env = "CORPDIR_JWT_LEEWAY_SECS", default_value_t = 60)]
    pub jwt_leeway_secs: u64,

    /// Reject tokens issued longer ago than this.
    #[arg(long, env = "CORPDIR_MAX_TOKEN_AGE_SECS")]
    pub max_token_age_secs: Option<u64>,

    /// Background key refresh interval.
    #[arg(long, env = "CORPDIR_JWKS_REFRESH_SECS", default_value_t = 60)]
    pub jwks_refresh_secs: u64,

    /// Age after which a key set is refreshed on use.
    #[arg(long, env = "CORPDIR_JWKS_FRESHNESS_SECS", default_value_t = 300)]
    pub jwks_freshness_secs: u64,

    /// Age after which a key set is no longer served when refreshes fail.
    #[arg(long, env = "CORPDIR_JWKS_MAX_STALENESS_SECS", default_value_t = 3600)]
    pub jwks_max_staleness_secs: u64,

    /// Bound on one JWKS fetch.
    #[arg(long, env = "CORPDIR_JWKS_TIMEOUT_SECS", default_value_t = 5)]
    pub jwks_timeout_secs: u64,

    /// Keep keys removed from the JWKS verifiable for this long.
    #[arg(long, env = "CORPDIR_KEY_RETIREMENT_GRACE_SECS")]
    pub key_retirement_grace_secs: Option<u64>,

    /// Webhook secrets as `source=hex[,hex...];source2=hex`.
    #[arg(long, env = "CORPDIR_WEBHOOK_SECRETS", default_value = "", hide_env_values = true)]
    pub webhook_secrets: String,

    /// Webhook timestamp acceptance window.
    #[arg(long, env = "CORPDIR_WEBHOOK_WINDOW_SECS", default_value_t = 300)]
    pub webhook_window_secs: u64,

    /// Interval between purges of lapsed replay records.
    #[arg(long, env = "CORPDIR_REPLAY_PURGE_SECS", default_value_t = 60)]
    pub replay_purge_secs: u64,

    /// Trust mode: `production` or `development`.
    #[arg(long, env = "CORPDIR_TRUST_MODE", default_value = "production")]
    pub trust_mode: TrustMode,

    /// Accept `x-dev-user` in place of a token. Development trust mode only.
    #[arg(long, env = "CORPDIR_DEV_AUTH_BYPASS", default_value_t = false)]
    pub dev_auth_bypass: bool,

    /// Log output format.
    #[arg(long, env = "CORPDIR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Validated settings derived from [`Cli`].
#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen address.
    pub listen: SocketAddr,
    /// JWKS URL.
    pub jwks_url: String,
    /// Token policy.
    pub token: TokenConfig,
    /// Key cache policy.
    pub key_cache: KeyCacheConfig,
    /// Webhook policy.
    pub webhook: WebhookConfig,
    /// Replay purge interval.
    pub replay_purge_interval: Duration,
    /// Trust mode.
    pub trust_mode: TrustMode,
    /// Development bypass.
    pub dev_bypass: DevBypassConfig,
}

impl Cli {
    /// Validate and convert.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty JWKS URL, an invalid token or
    /// key-cache policy, unparseable webhook secrets, or the development
    /// bypass under production trust.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        if self.jwks_url.trim().is_empty() {
            return Err(ConfigError::missing("jwks_url"));
        }
        if self.dev_auth_bypass && self.trust_mode == TrustMode::Production {
            return Err(ConfigError::InsecureDevelopmentBypass);
        }

        let token = TokenConfig::builder()
            .issuer(self.issuer.clone())
            .audiences(self.audience.iter().map(|a| a.trim()).filter(|a| !a.is_empty()))
            .leeway(Duration::from_secs(self.jwt_leeway_secs))
            .maybe_max_token_age(self.max_token_age_secs.map(Duration::from_secs))
            .accept_authorized_party(self.accept_azp)
            .build()?;

        let rotation = self
            .key_retirement_grace_secs
            .map_or(RotationPolicy::ReplaceWholesale, |secs| RotationPolicy::RetainRetired {
                grace: Duration::from_secs(secs),
            });
        let key_cache = KeyCacheConfig::builder()
            .freshness_window(Duration::from_secs(self.jwks_freshness_secs))
            .max_staleness(Duration::from_secs(self.jwks_max_staleness_secs))
            .refresh_interval(Duration::from_secs(self.jwks_refresh_secs))
            .fetch_timeout(Duration::from_secs(self.jwks_timeout_secs))
            .rotation(rotation)
            .build();
        key_cache.validate()?;

        let webhook = WebhookConfig::builder()
            .secrets(WebhookConfig::parse_secrets(&self.webhook_secrets)?)
            .acceptance_window(Duration::from_secs(self.webhook_window_secs))
            .build();

        if self.replay_purge_secs == 0 {
            return Err(ConfigError::invalid("replay_purge_secs", "must be non-zero"));
        }

        Ok(Settings {
            listen: self.listen,
            jwks_url: self.jwks_url.clone(),
            token,
            key_cache,
            webhook,
            replay_purge_interval: Duration::from_secs(self.replay_purge_secs),
            trust_mode: self.trust_mode,
            dev_bypass: DevBypassConfig::builder().enabled(self.dev_auth_bypass).build(),
        })
    }
}
