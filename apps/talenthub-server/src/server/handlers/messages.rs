use axum::{
    body::Body,
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    Json,
};
use talenthub_protocol::ApiEnvelope;

use crate::server::{
    auth::authenticate,
    core::{AppState, ATTACHMENT_MIME_ALLOWLIST},
    domain::{self, MessageDraft},
    errors::ApiFailure,
    storage::{UploadPolicy, ATTACHMENT_PREFIX},
    types::{
        AttachmentPayload, DeleteMessageRequest, EditMessageRequest, ListMessagesRequest,
        MessageDeleteResponse, MessageEditResponse, MessagePageResponse, MessageResponse,
        SendMessageRequest, UploadQuery,
    },
};

const MAX_FILENAME_CHARS: usize = 255;
const DEFAULT_FILENAME: &str = "attachment";

/// Last path segment of a client-supplied name, without control characters.
fn display_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_FILENAME_CHARS)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        DEFAULT_FILENAME.to_owned()
    } else {
        cleaned.to_owned()
    }
}

pub(crate) async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<MessageResponse>>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let message = domain::append_message(
        &state,
        auth.user_id,
        MessageDraft {
            conversation_id: payload.conversation_id,
            content: payload.content,
            reply_to_message_id: payload.reply_to_message_id,
            attachments: payload.attachments,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(ApiEnvelope::ok(message))))
}

pub(crate) async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ListMessagesRequest>,
) -> Result<Json<ApiEnvelope<MessagePageResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let page = domain::list_messages(
        &state,
        auth.user_id,
        &payload.conversation_id,
        payload.limit,
        payload.cursor,
    )
    .await?;
    Ok(Json(ApiEnvelope::ok(MessagePageResponse {
        messages: page.messages,
        next_cursor: page.next_cursor,
    })))
}

pub(crate) async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<EditMessageRequest>,
) -> Result<Json<ApiEnvelope<MessageEditResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let edit =
        domain::edit_message(&state, auth.user_id, &payload.message_id, &payload.content).await?;
    Ok(Json(ApiEnvelope::ok(MessageEditResponse {
        message_id: edit.message_id,
        conversation_id: edit.conversation_id,
        content: edit.content,
        edited_at: edit.edited_at_ms,
    })))
}

pub(crate) async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DeleteMessageRequest>,
) -> Result<Json<ApiEnvelope<MessageDeleteResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let tombstone =
        domain::soft_delete_message(&state, auth.user_id, &payload.message_id).await?;
    Ok(Json(ApiEnvelope::ok_with_message(
        MessageDeleteResponse {
            message_id: tombstone.message_id,
            conversation_id: tombstone.conversation_id,
            deleted_at: tombstone.deleted_at_ms,
        },
        "Message deleted",
    )))
}

/// Stores a raw request body as an attachment and returns its descriptor.
pub(crate) async fn upload_attachment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Result<Json<ApiEnvelope<AttachmentPayload>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let name = display_filename(&query.filename);
    let declared_content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let stored = state
        .storage
        .upload_stream(
            body,
            &UploadPolicy {
                prefix: ATTACHMENT_PREFIX,
                max_bytes: state.runtime.max_attachment_bytes,
                allowed_mime_types: &ATTACHMENT_MIME_ALLOWLIST,
                declared_content_type,
            },
        )
        .await?;

    tracing::info!(
        event = "messages.upload",
        user_id = %auth.user_id,
        key = %stored.key,
        size = stored.size,
        sha256 = %stored.sha256_hex,
    );
    Ok(Json(ApiEnvelope::ok(AttachmentPayload {
        url: state.storage.public_url(&stored.key),
        name,
        mime_type: stored.mime_type.to_owned(),
        size: stored.size,
    })))
}
