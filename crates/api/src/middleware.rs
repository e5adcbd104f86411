//! Bearer authentication for `/v1` routes.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use corpdir_authn::Principal;

use crate::{error::ApiError, state::AppState};

/// Authenticate the request and store its [`Principal`] in the extensions.
///
/// # Errors
///
/// Any authentication failure, rendered by [`ApiError`].
pub async fn require_principal(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = state.authenticator.authenticate(req.headers(), Utc::now()).await?;
    tracing::debug!(
        sub = principal.subject(),
        trust = principal.trust_level(),
        path = %req.uri().path(),
        "request authenticated"
    );
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Fail with [`ApiError::Forbidden`] unless `principal` holds `scope`.
///
/// # Errors
///
/// [`ApiError::Forbidden`].
pub fn require_scope(principal: &Principal, scope: &'static str) -> Result<(), ApiError> {
    if principal.has_scope(scope) { Ok(()) } else { Err(ApiError::Forbidden { scope }) }
}
