use axum::{extract::State, Json};
use talenthub_core::Username;
use talenthub_protocol::ApiEnvelope;

use crate::server::{
    core::AppState,
    errors::ApiFailure,
    types::{ProfileRequest, UserSummary},
    user_repository::{UserPersistence, UserRepository},
};

/// Public profile lookup; needs no session.
pub(crate) async fn user_profile(
    State(state): State<AppState>,
    Json(payload): Json<ProfileRequest>,
) -> Result<Json<ApiEnvelope<UserSummary>>, ApiFailure> {
    let username =
        Username::try_from(payload.username).map_err(|_| ApiFailure::NotFound("User not found"))?;
    let user = UserRepository::from_state(&state)
        .find_by_username(username.as_str())
        .await?
        .ok_or(ApiFailure::NotFound("User not found"))?;
    Ok(Json(ApiEnvelope::ok(UserSummary::from_record(
        &user,
        &state.storage,
    ))))
}
