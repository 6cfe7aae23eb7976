use axum::{extract::State, http::HeaderMap, Json};
use talenthub_protocol::ApiEnvelope;

use crate::server::{
    auth::authenticate,
    core::AppState,
    domain::{self, parse_user_id},
    errors::ApiFailure,
    types::{
        ChannelConversationResponse, ConversationFromChannelRequest, ConversationSummaryResponse,
        DmConversationResponse, DmUpsertRequest, MarkReadRequest, ReadMarkResponse,
    },
};

pub(crate) async fn conversation_from_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ConversationFromChannelRequest>,
) -> Result<Json<ApiEnvelope<ChannelConversationResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let channel = domain::channel_in_server(&state, &payload.server_id, &payload.channel_id)
        .await?
        .ok_or(ApiFailure::NotFound("Channel not found"))?;
    let resolved = domain::resolve_channel_conversation(&state, auth.user_id, &channel).await?;
    tracing::info!(
        event = "conversations.from_channel",
        conversation_id = %resolved.conversation_id,
        channel_id = %resolved.channel_id
    );
    Ok(Json(ApiEnvelope::ok(resolved.into())))
}

pub(crate) async fn upsert_dm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DmUpsertRequest>,
) -> Result<Json<ApiEnvelope<DmConversationResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let other = parse_user_id(payload.other_user_id)?;
    let resolved = domain::resolve_or_create_dm(&state, auth.user_id, other).await?;
    Ok(Json(ApiEnvelope::ok(DmConversationResponse {
        conversation_id: resolved.conversation_id,
        dm_key: resolved.dm_key.as_str().to_owned(),
    })))
}

pub(crate) async fn mark_conversation_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<MarkReadRequest>,
) -> Result<Json<ApiEnvelope<ReadMarkResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let mark = domain::mark_read(
        &state,
        auth.user_id,
        &payload.conversation_id,
        &payload.message_id,
    )
    .await?;
    Ok(Json(ApiEnvelope::ok(mark)))
}

pub(crate) async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<ConversationSummaryResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let conversations = domain::list_conversations(&state, auth.user_id).await?;
    Ok(Json(ApiEnvelope::ok(conversations)))
}
