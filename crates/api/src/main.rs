//! `corpdir-api` server binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use corpdir_api::{AppState, config::Cli, logging, router};
use corpdir_authn::{
    Authenticator, HttpKeySource, KeyCache, KeySource, ReplayGuard, StorageReplayGuard,
    TokenValidator, WebhookVerifier,
};
use corpdir_storage::MemoryBackend;
use tokio::{net::TcpListener, signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let settings = cli.settings().context("invalid configuration")?;
    tracing::info!(
        listen = %settings.listen,
        issuer = settings.token.issuer(),
        trust_mode = %settings.trust_mode,
        "starting corpdir-api"
    );

    let storage = MemoryBackend::new();

    let source: Arc<dyn KeySource> = Arc::new(
        HttpKeySource::new(&settings.jwks_url, settings.key_cache.fetch_timeout)
            .context("could not build the JWKS client")?,
    );
    let refresh_interval = settings.key_cache.refresh_interval;
    let keys = Arc::new(KeyCache::new(source, settings.key_cache.clone())?)
        .start_background_refresh(refresh_interval);

    let validator = TokenValidator::new(settings.token.clone(), Arc::clone(&keys))?;
    let authenticator =
        Authenticator::new(validator, settings.trust_mode, settings.dev_bypass.clone())?;

    let retention = settings.webhook.replay_retention();
    let replay = Arc::new(StorageReplayGuard::new(storage.clone(), retention))
        .start_purge_task(settings.replay_purge_interval);
    let guard: Arc<dyn ReplayGuard> = replay.clone();
    let webhooks = WebhookVerifier::new(&settings.webhook, guard)?;

    let app = router(AppState::new(authenticator, webhooks, storage));

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("could not bind {}", settings.listen))?;
    tracing::info!(addr = %settings.listen, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("server stopped, cancelling background tasks");
    keys.shutdown().await;
    replay.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(err) => {
                tracing::error!(error = %err, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
