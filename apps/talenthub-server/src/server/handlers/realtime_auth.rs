use axum::{extract::State, http::HeaderMap, Json};
use talenthub_protocol::ApiEnvelope;

use crate::server::{
    auth::authenticate,
    core::AppState,
    errors::ApiFailure,
    realtime::authorize_subscription,
    types::{RealtimeAuthRequest, RealtimeAuthResponse},
};

/// Signs a private channel subscription for a socket the caller holds.
pub(crate) async fn realtime_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RealtimeAuthRequest>,
) -> Result<Json<ApiEnvelope<RealtimeAuthResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let signature =
        authorize_subscription(&state, auth.user_id, &payload.socket_id, payload.channel_name)
            .await?;
    Ok(Json(ApiEnvelope::ok(RealtimeAuthResponse { auth: signature })))
}
