//! `POST /v1/ingestion/events`: signed webhook deliveries.
//!
//! | Verdict | Status |
//! |---------|--------|
//! | accepted | 202 |
//! | duplicate | 200; the sender should stop retrying |
//! | signature_invalid | 401 |
//! | expired | 400 |
//!
//! An accepted delivery whose payload cannot be stored is released from the
//! replay guard before the error is returned, so the sender's retry is
//! accepted rather than reported as a duplicate.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use corpdir_authn::{DeliveryVerdict, WebhookDelivery, webhook::SIGNATURE_HEADER};
use corpdir_storage::{StorageBackend, StorageError};
use serde_json::json;

use crate::{
    error::{ApiError, json_error},
    state::{AppState, INGEST_NAMESPACE},
};

/// Verify a delivery and store its payload when accepted.
///
/// # Errors
///
/// Malformed bodies and replay-store or storage faults.
#[tracing::instrument(skip_all)]
pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let (delivery, verdict) = state.webhooks.verify_request(&body, signature, Utc::now()).await?;

    let response = match verdict {
        DeliveryVerdict::Accepted => {
            if let Err(err) = forward(&state, &delivery).await {
                if let Err(release_err) =
                    state.webhooks.release(&delivery.source, &delivery.nonce).await
                {
                    tracing::error!(
                        source = %delivery.source,
                        nonce = %delivery.nonce,
                        error = %release_err,
                        "failed to release delivery after forward failure; retries will be reported as duplicates"
                    );
                }
                return Err(err);
            }
            (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response()
        },
        DeliveryVerdict::Duplicate => {
            (StatusCode::OK, Json(json!({ "status": "duplicate" }))).into_response()
        },
        DeliveryVerdict::SignatureInvalid => {
            json_error(StatusCode::UNAUTHORIZED, "signature_invalid", "signature does not verify")
        },
        DeliveryVerdict::Expired => {
            json_error(StatusCode::BAD_REQUEST, "expired", "timestamp outside the acceptance window")
        },
    };
    Ok(response)
}

/// Storage key of an accepted delivery.
///
/// Both components are hex-encoded so a `/` inside either cannot collide
/// with another pair.
pub fn ingest_key(source: &str, nonce: &str) -> Vec<u8> {
    format!("{INGEST_NAMESPACE}/{}/{}", hex::encode(source), hex::encode(nonce)).into_bytes()
}

async fn forward(state: &AppState, delivery: &WebhookDelivery) -> Result<(), ApiError> {
    let record = json!({
        "sourceKey": delivery.source_key,
        "ts": delivery.ts,
        "payload": delivery.payload,
    });
    let bytes = serde_json::to_vec(&record).map_err(|e| StorageError::serialization(e.to_string()))?;
    state.storage.set(ingest_key(&delivery.source, &delivery.nonce), bytes).await?;
    tracing::info!(
        source = %delivery.source,
        nonce = %delivery.nonce,
        "delivery forwarded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_key_is_unambiguous() {
        assert_ne!(ingest_key("a/b", "c"), ingest_key("a", "b/c"));
        assert!(ingest_key("crm", "n1").starts_with(format!("{INGEST_NAMESPACE}/").as_bytes()));
    }
}
