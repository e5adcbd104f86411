//! Mapping of library outcomes to HTTP responses.
//!
//! Authentication failures collapse to one 401 body; the specific reason
//! goes to the log only. Infrastructure faults are 503 so callers retry
//! later instead of re-authenticating.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use corpdir_authn::{AuthError, WebhookError};
use corpdir_concurrency::ConcurrencyError;
use serde_json::json;

/// JSON error body `{"error": code, "message": ...}`.
pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": code, "message": message.into() }))).into_response()
}

/// A request that could not be served.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Token or credential rejected, or keys unavailable.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The principal lacks a scope the route requires.
    #[error("missing scope {scope}")]
    Forbidden {
        /// The required scope.
        scope: &'static str,
    },

    /// Webhook body malformed or replay store failing.
    #[error(transparent)]
    Webhook(#[from] WebhookError),

    /// Resource lookup or versioned write failed.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Request body unusable.
    #[error("{0}")]
    BadRequest(String),

    /// Storage failure outside the controller.
    #[error(transparent)]
    Storage(#[from] corpdir_storage::StorageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Auth(err) if err.is_infrastructure() => {
                tracing::error!(reason = err.reason(), error = %err, "authentication unavailable");
                json_error(StatusCode::SERVICE_UNAVAILABLE, "service_not_ready", "signing keys unavailable")
            },
            Self::Auth(err) => {
                tracing::warn!(reason = err.reason(), error = %err, "authentication failed");
                json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "authentication required")
            },
            Self::Forbidden { scope } => {
                tracing::warn!(scope, reason = "missing_scope", "request forbidden");
                json_error(StatusCode::FORBIDDEN, "forbidden", format!("requires scope {scope}"))
            },
            Self::Webhook(WebhookError::MalformedDelivery { message }) => {
                json_error(StatusCode::BAD_REQUEST, "malformed_delivery", message)
            },
            Self::Webhook(err) => {
                tracing::error!(error = %err, "webhook replay store failure");
                json_error(StatusCode::SERVICE_UNAVAILABLE, "service_not_ready", "replay store unavailable")
            },
            Self::Concurrency(err) => concurrency_response(&err),
            Self::BadRequest(message) => json_error(StatusCode::BAD_REQUEST, "bad_request", message),
            Self::Storage(err) => {
                tracing::error!(error = %err, "storage failure");
                json_error(StatusCode::SERVICE_UNAVAILABLE, "service_not_ready", "storage unavailable")
            },
        }
    }
}

fn concurrency_response(err: &ConcurrencyError) -> Response {
    match err {
        ConcurrencyError::NotFound { .. } => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        ConcurrencyError::AlreadyExists { .. } => {
            json_error(StatusCode::CONFLICT, "already_exists", err.to_string())
        },
        ConcurrencyError::PreconditionRequired => json_error(
            StatusCode::PRECONDITION_REQUIRED,
            "precondition_required",
            "send If-Match with the ETag you read",
        ),
        ConcurrencyError::Serialization { .. } => {
            tracing::error!(error = %err, "stored resource unreadable");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", "stored resource unreadable")
        },
        _ => {
            tracing::error!(error = %err, "storage failure");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "service_not_ready", "storage unavailable")
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use corpdir_storage::StorageError;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ApiError::Auth(AuthError::invalid_signature()), StatusCode::UNAUTHORIZED)]
    #[case(ApiError::Auth(AuthError::MissingCredentials), StatusCode::UNAUTHORIZED)]
    #[case(ApiError::Auth(AuthError::keys_unavailable("down")), StatusCode::SERVICE_UNAVAILABLE)]
    #[case(ApiError::Forbidden { scope: "directory.write" }, StatusCode::FORBIDDEN)]
    #[case(ApiError::Webhook(WebhookError::malformed("bad")), StatusCode::BAD_REQUEST)]
    #[case(ApiError::Webhook(StorageError::timeout().into()), StatusCode::SERVICE_UNAVAILABLE)]
    #[case(ApiError::Concurrency(ConcurrencyError::not_found("c")), StatusCode::NOT_FOUND)]
    #[case(ApiError::Concurrency(ConcurrencyError::PreconditionRequired), StatusCode::PRECONDITION_REQUIRED)]
    #[case(ApiError::Concurrency(StorageError::connection("x").into()), StatusCode::SERVICE_UNAVAILABLE)]
    fn test_status_mapping(#[case] err: ApiError, #[case] status: StatusCode) {
        assert_eq!(err.into_response().status(), status);
    }
}
