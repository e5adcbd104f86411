//! `GET /v1/me`.

use axum::{Extension, Json, response::IntoResponse};
use corpdir_authn::Principal;
use serde_json::json;

/// Echo the authenticated principal.
pub async fn me(Extension(principal): Extension<Principal>) -> impl IntoResponse {
    Json(json!({
        "subject": principal.subject(),
        "scopes": principal.scopes(),
        "trust_level": principal.trust_level(),
    }))
}
