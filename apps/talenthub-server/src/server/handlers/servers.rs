use axum::{
    body::Body,
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    Json,
};
use talenthub_core::ServerName;
use talenthub_protocol::ApiEnvelope;

use crate::server::{
    auth::{authenticate, now_unix_ms},
    core::{AppState, ServerBanRecord, ServerRecord, IMAGE_MIME_ALLOWLIST},
    domain::{self, parse_user_id, user_summaries, JoinOutcome, ServerChanges},
    errors::ApiFailure,
    storage::{UploadPolicy, SERVER_ICON_PREFIX},
    types::{
        BanMemberRequest, ChannelResponse, CreateServerRequest, DiscoverServersRequest,
        InviteKeyRequest, InviteKeyResponse, JoinServerRequest, MuteMemberRequest,
        ServerIdQuery, ServerIdRequest, ServerMemberResponse, ServerMemberTargetRequest,
        ServerPreviewResponse, ServerResponse, ServerWithChannelsResponse, UpdateServerRequest,
    },
};

fn parse_server_name(raw: String) -> Result<ServerName, ApiFailure> {
    ServerName::try_from(raw)
        .map_err(|_| ApiFailure::InvalidRequest("Server name must be between 1 and 100 characters"))
}

async fn with_channels(
    state: &AppState,
    server: &ServerRecord,
) -> Result<ServerWithChannelsResponse, ApiFailure> {
    let channels = domain::list_channels(state, &server.server_id).await?;
    Ok(ServerWithChannelsResponse {
        server: ServerResponse::from_record(server, &state.storage),
        channels: channels.iter().map(ChannelResponse::from).collect(),
    })
}

async fn preview(
    state: &AppState,
    server: &ServerRecord,
) -> Result<ServerPreviewResponse, ApiFailure> {
    Ok(ServerPreviewResponse {
        id: server.server_id.clone(),
        name: server.name.clone(),
        icon_url: server
            .icon_key
            .as_deref()
            .map(|key| state.storage.public_url(key)),
        is_public: server.is_public,
        member_count: domain::member_count(state, &server.server_id).await?,
    })
}

pub(crate) async fn create_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateServerRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<ServerWithChannelsResponse>>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let name = parse_server_name(payload.name)?;
    let (server, channels) =
        domain::create_server(&state, auth.user_id, &name, payload.is_public).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiEnvelope::ok(ServerWithChannelsResponse {
            server: ServerResponse::from_record(&server, &state.storage),
            channels: channels.iter().map(ChannelResponse::from).collect(),
        })),
    ))
}

pub(crate) async fn list_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<ServerResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let servers = domain::servers_for_user(&state, auth.user_id).await?;
    Ok(Json(ApiEnvelope::ok(
        servers
            .iter()
            .map(|server| ServerResponse::from_record(server, &state.storage))
            .collect(),
    )))
}

pub(crate) async fn update_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateServerRequest>,
) -> Result<Json<ApiEnvelope<ServerResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    domain::require_owner(&state, &payload.server_id, auth.user_id).await?;
    let name = payload.name.map(parse_server_name).transpose()?;
    if payload.remove_icon {
        if let Some(previous) = domain::set_server_icon(&state, &payload.server_id, None).await? {
            state.storage.delete_best_effort(&previous).await;
        }
    }
    let server = domain::update_server(
        &state,
        &payload.server_id,
        ServerChanges {
            name: name.as_ref(),
            is_public: payload.is_public,
        },
    )
    .await?;
    tracing::info!(event = "servers.update", server_id = %server.server_id);
    Ok(Json(ApiEnvelope::ok(ServerResponse::from_record(
        &server,
        &state.storage,
    ))))
}

pub(crate) async fn upload_server_icon(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ServerIdQuery>,
    body: Body,
) -> Result<Json<ApiEnvelope<ServerResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    domain::require_owner(&state, &query.server_id, auth.user_id).await?;
    let declared_content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let stored = state
        .storage
        .upload_stream(
            body,
            &UploadPolicy {
                prefix: SERVER_ICON_PREFIX,
                max_bytes: state.runtime.max_image_bytes,
                allowed_mime_types: &IMAGE_MIME_ALLOWLIST,
                declared_content_type,
            },
        )
        .await?;

    let previous = match domain::set_server_icon(&state, &query.server_id, Some(&stored.key)).await
    {
        Ok(previous) => previous,
        Err(error) => {
            state.storage.delete_best_effort(&stored.key).await;
            return Err(error);
        }
    };
    if let Some(previous) = previous {
        state.storage.delete_best_effort(&previous).await;
    }
    let server = domain::load_server(&state, &query.server_id)
        .await?
        .ok_or(ApiFailure::NotFound("Server not found"))?;
    Ok(Json(ApiEnvelope::ok(ServerResponse::from_record(
        &server,
        &state.storage,
    ))))
}

pub(crate) async fn delete_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ServerIdRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    domain::require_owner(&state, &payload.server_id, auth.user_id).await?;
    if let Some(icon_key) = domain::delete_server(&state, &payload.server_id).await? {
        state.storage.delete_best_effort(&icon_key).await;
    }
    tracing::info!(event = "servers.delete", server_id = %payload.server_id, owner_id = %auth.user_id);
    Ok(Json(ApiEnvelope::done("Server deleted")))
}

pub(crate) async fn discover_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DiscoverServersRequest>,
) -> Result<Json<ApiEnvelope<Vec<ServerPreviewResponse>>>, ApiFailure> {
    authenticate(&state, &headers).await?;
    let servers = domain::discover_servers(&state, payload.query.as_deref()).await?;
    let mut previews = Vec::with_capacity(servers.len());
    for server in &servers {
        previews.push(preview(&state, server).await?);
    }
    Ok(Json(ApiEnvelope::ok(previews)))
}

pub(crate) async fn invite_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<InviteKeyRequest>,
) -> Result<Json<ApiEnvelope<ServerPreviewResponse>>, ApiFailure> {
    authenticate(&state, &headers).await?;
    let server = domain::server_by_invite(&state, payload.invite_key.trim())
        .await?
        .ok_or(ApiFailure::NotFound("Invite not found"))?;
    Ok(Json(ApiEnvelope::ok(preview(&state, &server).await?)))
}

pub(crate) async fn join_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<JoinServerRequest>,
) -> Result<Json<ApiEnvelope<ServerWithChannelsResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let server = match (payload.invite_key, payload.server_id) {
        (Some(invite_key), _) => domain::server_by_invite(&state, invite_key.trim())
            .await?
            .ok_or(ApiFailure::NotFound("Invite not found"))?,
        (None, Some(server_id)) => domain::load_server(&state, &server_id)
            .await?
            .filter(|server| server.is_public)
            .ok_or(ApiFailure::NotFound("Server not found"))?,
        (None, None) => {
            return Err(ApiFailure::InvalidRequest(
                "invite_key or server_id is required",
            ))
        }
    };

    let outcome = domain::join_server(&state, &server.server_id, auth.user_id).await?;
    tracing::info!(
        event = "servers.join",
        server_id = %server.server_id,
        user_id = %auth.user_id,
        outcome = ?outcome
    );
    let message = match outcome {
        JoinOutcome::Joined => "Joined server",
        JoinOutcome::AlreadyMember => "Already a member",
    };
    Ok(Json(ApiEnvelope::ok_with_message(
        with_channels(&state, &server).await?,
        message,
    )))
}

pub(crate) async fn leave_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ServerIdRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let server = domain::load_server(&state, &payload.server_id)
        .await?
        .ok_or(ApiFailure::NotFound("Server not found"))?;
    if server.owner_id == auth.user_id {
        return Err(ApiFailure::InvalidRequest(
            "Owner cannot leave; delete the server instead",
        ));
    }
    if !domain::remove_member(&state, &server.server_id, auth.user_id).await? {
        return Err(ApiFailure::NotFound("You are not a member of this server"));
    }
    tracing::info!(event = "servers.leave", server_id = %server.server_id, user_id = %auth.user_id);
    Ok(Json(ApiEnvelope::done("Left server")))
}

pub(crate) async fn list_server_members(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ServerIdRequest>,
) -> Result<Json<ApiEnvelope<Vec<ServerMemberResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    if domain::server_member(&state, &payload.server_id, auth.user_id)
        .await?
        .is_none()
    {
        return Err(ApiFailure::Forbidden("You are not a member of this server"));
    }
    let rows = domain::server_members(&state, &payload.server_id).await?;
    let users = user_summaries(&state, rows.iter().map(|row| row.user_id)).await?;
    Ok(Json(ApiEnvelope::ok(
        rows.into_iter()
            .map(|row| ServerMemberResponse {
                user_id: row.user_id.to_string(),
                user: users.get(&row.user_id).cloned(),
                roles: row.member.roles,
                muted: row.member.muted,
                joined_at: row.member.joined_at_ms,
            })
            .collect(),
    )))
}

pub(crate) async fn kick_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ServerMemberTargetRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    domain::require_owner(&state, &payload.server_id, auth.user_id).await?;
    let target = parse_user_id(payload.user_id)?;
    domain::moderation_target(&state, &payload.server_id, target).await?;
    if !domain::remove_member(&state, &payload.server_id, target).await? {
        return Err(ApiFailure::NotFound("Member not found"));
    }
    tracing::info!(event = "servers.kick", server_id = %payload.server_id, target_id = %target);
    Ok(Json(ApiEnvelope::done("Member kicked")))
}

pub(crate) async fn ban_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BanMemberRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    domain::require_owner(&state, &payload.server_id, auth.user_id).await?;
    let target = parse_user_id(payload.user_id)?;
    domain::moderation_target(&state, &payload.server_id, target).await?;
    let reason = payload
        .reason
        .map(|reason| reason.trim().to_owned())
        .filter(|reason| !reason.is_empty());
    domain::ban_member(
        &state,
        &payload.server_id,
        target,
        ServerBanRecord {
            banned_by_user_id: auth.user_id,
            reason,
            created_at_ms: now_unix_ms(),
        },
    )
    .await?;
    tracing::info!(event = "servers.ban", server_id = %payload.server_id, target_id = %target);
    Ok(Json(ApiEnvelope::done("Member banned")))
}

pub(crate) async fn mute_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<MuteMemberRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    domain::require_owner(&state, &payload.server_id, auth.user_id).await?;
    let target = parse_user_id(payload.user_id)?;
    domain::moderation_target(&state, &payload.server_id, target).await?;
    if !domain::set_member_muted(&state, &payload.server_id, target, payload.muted).await? {
        return Err(ApiFailure::NotFound("Member not found"));
    }
    tracing::info!(
        event = "servers.mute",
        server_id = %payload.server_id,
        target_id = %target,
        muted = payload.muted
    );
    Ok(Json(ApiEnvelope::done(if payload.muted {
        "Member muted"
    } else {
        "Member unmuted"
    })))
}

pub(crate) async fn regenerate_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ServerIdRequest>,
) -> Result<Json<ApiEnvelope<InviteKeyResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    domain::require_owner(&state, &payload.server_id, auth.user_id).await?;
    let invite_key = domain::regenerate_invite_key(&state, &payload.server_id).await?;
    tracing::info!(event = "servers.regenerate_invite", server_id = %payload.server_id);
    Ok(Json(ApiEnvelope::ok(InviteKeyResponse { invite_key })))
}
