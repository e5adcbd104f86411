//! Shared request state.

use std::sync::Arc;

use corpdir_authn::{Authenticator, KeyCache, WebhookVerifier};
use corpdir_concurrency::ConcurrencyController;
use corpdir_storage::MemoryBackend;

/// Storage namespace of contact records.
pub const CONTACTS_NAMESPACE: &str = "contacts";

/// Storage namespace of accepted webhook payloads.
pub const INGEST_NAMESPACE: &str = "ingest";

/// Everything handlers need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Request authentication.
    pub authenticator: Arc<Authenticator>,
    /// Webhook verification.
    pub webhooks: Arc<WebhookVerifier>,
    /// Versioned contact records.
    pub contacts: Arc<ConcurrencyController<MemoryBackend>>,
    /// Backing store shared by contacts, ingested payloads and replay records.
    pub storage: MemoryBackend,
}

impl AppState {
    /// Wire the state over `storage`.
    pub fn new(authenticator: Authenticator, webhooks: WebhookVerifier, storage: MemoryBackend) -> Self {
        Self {
            authenticator: Arc::new(authenticator),
            webhooks: Arc::new(webhooks),
            contacts: Arc::new(ConcurrencyController::new(storage.clone(), CONTACTS_NAMESPACE)),
            storage,
        }
    }

    /// The key cache behind the authenticator.
    pub fn key_cache(&self) -> &Arc<KeyCache> {
        self.authenticator.validator().key_cache()
    }
}
