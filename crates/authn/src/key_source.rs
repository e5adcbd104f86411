//! Where verification keys come from.

use std::time::Duration;

use async_trait::async_trait;

use crate::{error::AuthError, jwks::JwkSet};

/// A source of the current JWKS document.
///
/// Implementations fetch the whole set every time; the
/// [`KeyCache`](crate::key_cache::KeyCache) decides when to call them and
/// bounds each call with its own timeout.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the current key set.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySource`] if the source cannot be reached or
    /// returns an unusable document.
    async fn fetch(&self) -> Result<JwkSet, AuthError>;
}

/// Fetches a JWKS document over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySource {
    /// Creates a source for `url` whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySource`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::key_source_with_source("failed to build HTTP client", e))?;
        Ok(Self { client, url: url.into() })
    }

    /// The JWKS URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| AuthError::key_source_with_source("JWKS request failed", e))?
            .error_for_status()
            .map_err(|e| AuthError::key_source_with_source("JWKS endpoint returned an error", e))?;

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::key_source_with_source("JWKS body is not a key set", e))?;

        tracing::debug!(keys = jwks.keys.len(), "fetched JWKS");
        Ok(jwks)
    }
}
