//! Route table.

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{middleware::require_principal, state::AppState};

pub mod contacts;
pub mod health;
pub mod ingestion;
pub mod me;

/// Build the application router.
///
/// `/health`, `/ready` and the webhook endpoint are public; the webhook's
/// HMAC signature is its credential. Everything else under `/v1` requires
/// an authenticated principal.
pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/v1/me", get(me::me))
        .route("/v1/contacts", post(contacts::create))
        .route("/v1/contacts/:id", get(contacts::read).put(contacts::replace))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_principal));

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/ingestion/events", post(ingestion::ingest))
        .merge(authenticated)
        .with_state(state)
}
