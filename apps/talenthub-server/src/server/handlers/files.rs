use axum::{
    extract::{Path, Query, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, HeaderName, HeaderValue,
    },
    response::Response,
    Json,
};
use bytes::Bytes;
use talenthub_protocol::ApiEnvelope;

use crate::server::{
    auth::{authenticate, now_unix},
    core::AppState,
    errors::ApiFailure,
    storage::{ObjectStorage, ATTACHMENT_PREFIX},
    types::{SignedFileQuery, SignedUrlRequest, SignedUrlResponse},
};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

fn file_response(payload: Bytes, cache_control: &'static str) -> Result<Response, ApiFailure> {
    let content_type = infer::get(&payload).map_or(FALLBACK_CONTENT_TYPE, |kind| kind.mime_type());
    let content_len =
        HeaderValue::from_str(&payload.len().to_string()).map_err(|_| ApiFailure::Internal)?;
    let mut response = Response::new(payload.into());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response.headers_mut().insert(CONTENT_LENGTH, content_len);
    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    Ok(response)
}

/// Serves avatars, icons and attachments by key.
pub(crate) async fn public_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiFailure> {
    if !ObjectStorage::is_public_key(&key) {
        return Err(ApiFailure::NotFound("File not found"));
    }
    let payload = state.storage.get(&key).await?;
    file_response(payload, "public, max-age=86400")
}

pub(crate) async fn signed_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedFileQuery>,
) -> Result<Response, ApiFailure> {
    if !state
        .storage
        .verify_signature(&key, query.expires, &query.signature, now_unix())
    {
        return Err(ApiFailure::Forbidden("Link expired or invalid"));
    }
    let payload = state.storage.get(&key).await?;
    file_response(payload, "private, no-store")
}

/// Short-lived link for an attachment key.
pub(crate) async fn issue_signed_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SignedUrlRequest>,
) -> Result<Json<ApiEnvelope<SignedUrlResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let key = payload.key.trim();
    let under_attachments = key
        .strip_prefix(ATTACHMENT_PREFIX)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|rest| !rest.is_empty());
    if !under_attachments {
        return Err(ApiFailure::InvalidRequest("Invalid file key"));
    }
    ObjectStorage::parse_key(key)?;

    let ttl = i64::try_from(state.runtime.signed_url_ttl.as_secs()).unwrap_or(i64::MAX);
    let expires_at = now_unix().saturating_add(ttl);
    tracing::debug!(event = "files.sign", user_id = %auth.user_id, key = %key);
    Ok(Json(ApiEnvelope::ok(SignedUrlResponse {
        url: state.storage.signed_url(key, expires_at),
        expires_at,
    })))
}
