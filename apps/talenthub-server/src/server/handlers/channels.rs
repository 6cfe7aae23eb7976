use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use talenthub_core::ChannelName;
use talenthub_protocol::ApiEnvelope;

use crate::server::{
    auth::authenticate,
    core::AppState,
    domain::{self, ResolvedChannel},
    errors::ApiFailure,
    types::{
        ChannelByKeyRequest, ChannelConversationResponse, ChannelResponse, CreateChannelRequest,
        ServerIdRequest,
    },
};

impl From<ResolvedChannel> for ChannelConversationResponse {
    fn from(resolved: ResolvedChannel) -> Self {
        Self {
            conversation_id: resolved.conversation_id,
            server_id: resolved.server_id,
            channel_id: resolved.channel_id,
            channel_key: resolved.channel_key,
            channel_name: resolved.channel_name,
        }
    }
}

pub(crate) async fn list_server_channels(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ServerIdRequest>,
) -> Result<Json<ApiEnvelope<Vec<ChannelResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    if domain::server_member(&state, &payload.server_id, auth.user_id)
        .await?
        .is_none()
    {
        return Err(ApiFailure::Forbidden("You are not a member of this server"));
    }
    let channels = domain::list_channels(&state, &payload.server_id).await?;
    Ok(Json(ApiEnvelope::ok(
        channels.iter().map(ChannelResponse::from).collect(),
    )))
}

pub(crate) async fn create_server_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateChannelRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<ChannelResponse>>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let name = ChannelName::try_from(payload.name).map_err(|_| {
        ApiFailure::InvalidRequest("Channel name must be between 1 and 100 characters")
    })?;
    domain::require_owner(&state, &payload.server_id, auth.user_id).await?;
    let channel = domain::create_channel(&state, &payload.server_id, &name).await?;
    tracing::info!(
        event = "channels.create",
        server_id = %payload.server_id,
        channel_id = %channel.channel_id
    );
    Ok((
        StatusCode::CREATED,
        Json(ApiEnvelope::ok(ChannelResponse::from(&channel))),
    ))
}

/// Opens a channel from a shared link.
pub(crate) async fn channel_by_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChannelByKeyRequest>,
) -> Result<Json<ApiEnvelope<ChannelConversationResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let channel = domain::channel_by_key(&state, payload.channel_key.trim())
        .await?
        .ok_or(ApiFailure::NotFound("Channel not found"))?;
    let resolved = domain::resolve_channel_conversation(&state, auth.user_id, &channel).await?;
    Ok(Json(ApiEnvelope::ok(resolved.into())))
}
