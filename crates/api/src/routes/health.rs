//! Liveness and readiness probes.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use corpdir_storage::{HealthProbe, StorageBackend};
use serde_json::json;

use crate::state::AppState;

/// `GET /health`: the process is up.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /ready`: keys are loaded and storage can serve.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let keys = state.key_cache();
    let keys_ready = keys.is_ready_at(Utc::now());
    let storage_ready = match state.storage.health_check(HealthProbe::Readiness).await {
        Ok(status) => status.can_serve(),
        Err(err) => {
            tracing::warn!(error = %err, "storage readiness probe failed");
            false
        },
    };

    let checks = json!({
        "keys": if keys_ready { "ok" } else { "missing" },
        "storage": if storage_ready { "ok" } else { "unhealthy" },
    });

    if keys_ready && storage_ready {
        (StatusCode::OK, Json(json!({ "status": "ready", "checks": checks })))
    } else {
        tracing::warn!(checks = %checks, key_cache = ?keys.status(), "not ready");
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "not_ready", "checks": checks })))
    }
}
