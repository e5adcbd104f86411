//! Contact records with `ETag` / `If-Match` concurrency.
//!
//! A contact is an opaque JSON object. Reads return its version as `ETag`;
//! a `PUT` must echo it in `If-Match` and replaces the whole object.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use corpdir_authn::Principal;
use corpdir_concurrency::{UpdateOutcome, VersionToken, Versioned};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::{
    error::{ApiError, json_error},
    middleware::require_scope,
    state::AppState,
};

const READ_SCOPE: &str = "directory.read";
const WRITE_SCOPE: &str = "directory.write";

fn parse_contact(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(contact)) => Ok(contact),
        Ok(_) => Err(ApiError::BadRequest("contact must be a JSON object".to_owned())),
        Err(e) => Err(ApiError::BadRequest(format!("invalid JSON: {e}"))),
    }
}

fn contact_response(status: StatusCode, id: &str, contact: &Versioned<Value>) -> Response {
    let etag = contact.version.to_etag();
    (
        status,
        [(header::ETAG, etag.clone())],
        Json(json!({ "id": id, "etag": etag, "contact": contact.state })),
    )
        .into_response()
}

/// `POST /v1/contacts`.
///
/// # Errors
///
/// Missing scope, a body that is not a JSON object, or storage faults.
#[tracing::instrument(skip_all, fields(sub = principal.subject()))]
pub async fn create(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_scope(&principal, WRITE_SCOPE)?;
    let contact = Value::Object(parse_contact(&body)?);

    let id = Uuid::new_v4().to_string();
    let version = state.contacts.create(&id, &contact).await?;
    tracing::info!(audit.action = "contact_created", resource_id = %id, "contact created");

    let mut response =
        contact_response(StatusCode::CREATED, &id, &Versioned { state: contact, version });
    if let Ok(location) = format!("/v1/contacts/{id}").parse() {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// `GET /v1/contacts/:id`.
///
/// # Errors
///
/// Missing scope, unknown id, or storage faults.
pub async fn read(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    require_scope(&principal, READ_SCOPE)?;
    let contact: Versioned<Value> = state.contacts.read(&id).await?;
    Ok(contact_response(StatusCode::OK, &id, &contact))
}

/// `PUT /v1/contacts/:id`.
///
/// 428 without `If-Match` (or with `*`), 412 when it names a stale version.
///
/// # Errors
///
/// Missing scope, bad body, missing precondition, unknown id, or storage
/// faults.
#[tracing::instrument(skip_all, fields(sub = principal.subject(), resource_id = %id))]
pub async fn replace(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_scope(&principal, WRITE_SCOPE)?;
    let contact = Value::Object(parse_contact(&body)?);

    let expected = match headers.get(header::IF_MATCH) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| ApiError::BadRequest("If-Match is not visible ASCII".to_owned()))?;
            VersionToken::from_if_match(value)
        },
        None => None,
    };

    match state.contacts.update(&id, expected.as_ref(), |_: Value| contact).await? {
        UpdateOutcome::Updated(updated) => Ok(contact_response(StatusCode::OK, &id, &updated)),
        UpdateOutcome::Conflict => Ok(json_error(
            StatusCode::PRECONDITION_FAILED,
            "precondition_failed",
            "the contact changed since it was read; fetch it again",
        )),
    }
}
