use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    Json,
};
use talenthub_core::{validate_password, DisplayName, Email, UserId, Username};
use talenthub_protocol::ApiEnvelope;

use crate::server::{
    auth::{
        authenticate, authenticate_optional, generate_verification_code, hash_password,
        invalidate_all_sessions, issue_session_token, now_unix, now_unix_ms, verify_password,
    },
    core::{
        AppState, AuthContext, PendingVerificationRecord, UserRecord, IMAGE_MIME_ALLOWLIST,
        VERIFICATION_CODE_TTL_SECS,
    },
    errors::ApiFailure,
    metrics::record_auth_failure,
    storage::{UploadPolicy, AVATAR_PREFIX},
    types::{
        ChangeDisplayNameRequest, ChangePasswordRequest, ChangeUsernameRequest,
        CheckUsernameRequest, DeleteAccountRequest, SessionResponse, SigninRequest,
        SignupRequest, SignupResponse, UserResponse, UsernameAvailabilityResponse,
        VerifyOtpRequest,
    },
    user_repository::{UserPersistence, UserRepository},
};

const INVALID_PASSWORD_MESSAGE: &str = "Password must be between 8 and 128 characters";

fn session_response(
    state: &AppState,
    user: &UserRecord,
) -> Result<SessionResponse, ApiFailure> {
    let token = issue_session_token(state, user.id, user.session_epoch).map_err(|e| {
        tracing::error!(event = "auth.session.issue", error = %e);
        ApiFailure::Internal
    })?;
    Ok(SessionResponse {
        token,
        user: UserResponse::from_record(user, &state.storage),
    })
}

async fn current_user(state: &AppState, auth: &AuthContext) -> Result<UserRecord, ApiFailure> {
    UserRepository::from_state(state)
        .find_by_id(auth.user_id)
        .await?
        .ok_or(ApiFailure::Unauthorized)
}

/// Invalid names are reported as unavailable rather than rejected.
pub(crate) async fn check_username(
    State(state): State<AppState>,
    Json(payload): Json<CheckUsernameRequest>,
) -> Result<Json<ApiEnvelope<UsernameAvailabilityResponse>>, ApiFailure> {
    let Ok(username) = Username::try_from(payload.username) else {
        return Ok(Json(ApiEnvelope::ok(UsernameAvailabilityResponse {
            available: false,
        })));
    };
    let taken = UserRepository::from_state(&state)
        .find_by_username(username.as_str())
        .await?
        .is_some();
    Ok(Json(ApiEnvelope::ok(UsernameAvailabilityResponse {
        available: !taken,
    })))
}

pub(crate) async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> Result<Json<ApiEnvelope<SignupResponse>>, ApiFailure> {
    let email =
        Email::try_from(payload.email).map_err(|_| ApiFailure::InvalidRequest("Invalid email"))?;
    let username = Username::try_from(payload.username).map_err(|_| {
        ApiFailure::InvalidRequest("Username must be 3-20 letters, numbers or underscores")
    })?;
    let display_name = DisplayName::try_from(payload.display_name).map_err(|_| {
        ApiFailure::InvalidRequest("Display name must be between 1 and 50 characters")
    })?;
    validate_password(&payload.password)
        .map_err(|_| ApiFailure::InvalidRequest(INVALID_PASSWORD_MESSAGE))?;

    let repository = UserRepository::from_state(&state);
    let (email_taken, username_taken) = repository
        .identity_taken(email.as_str(), username.as_str())
        .await?;
    if email_taken {
        return Err(ApiFailure::Conflict("An account with this email already exists"));
    }
    if username_taken {
        return Err(ApiFailure::Conflict("Username is already taken"));
    }

    let password_hash = hash_password(&payload.password).map_err(|e| {
        tracing::error!(event = "auth.signup", error = %e);
        ApiFailure::Internal
    })?;
    let code = generate_verification_code();
    repository
        .save_pending(&PendingVerificationRecord {
            email: email.as_str().to_owned(),
            username: username.as_str().to_owned(),
            display_name: display_name.as_str().to_owned(),
            password_hash,
            code: code.clone(),
            expires_at_unix: now_unix() + VERIFICATION_CODE_TTL_SECS,
        })
        .await?;
    state
        .mailer
        .dispatch_verification_code(email.as_str(), &code);

    tracing::info!(event = "auth.signup", outcome = "pending");
    Ok(Json(ApiEnvelope::ok_with_message(
        SignupResponse {
            email: email.as_str().to_owned(),
            expires_in_secs: VERIFICATION_CODE_TTL_SECS,
        },
        "Verification code sent to your email",
    )))
}

pub(crate) async fn verify_otp(
    State(state): State<AppState>,
    Json(payload): Json<VerifyOtpRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<SessionResponse>>), ApiFailure> {
    let email =
        Email::try_from(payload.email).map_err(|_| ApiFailure::InvalidRequest("Invalid email"))?;
    let repository = UserRepository::from_state(&state);
    let pending = repository
        .find_pending(email.as_str(), now_unix())
        .await?
        .ok_or(ApiFailure::InvalidRequest(
            "No pending verification found or code expired, please sign up again",
        ))?;
    if pending.code != payload.otp.trim() {
        record_auth_failure("invalid_otp");
        return Err(ApiFailure::InvalidRequest("Invalid verification code"));
    }

    let user = repository
        .create_from_pending(&pending, UserId::new(), now_unix_ms())
        .await?
        .ok_or(ApiFailure::Conflict(
            "An account with this email or username already exists",
        ))?;

    tracing::info!(event = "auth.verify_otp", outcome = "created", user_id = %user.id);
    Ok((
        StatusCode::CREATED,
        Json(ApiEnvelope::ok_with_message(
            session_response(&state, &user)?,
            "Account created",
        )),
    ))
}

pub(crate) async fn signin(
    State(state): State<AppState>,
    Json(payload): Json<SigninRequest>,
) -> Result<Json<ApiEnvelope<SessionResponse>>, ApiFailure> {
    let user = match Email::try_from(payload.email) {
        Ok(email) => {
            UserRepository::from_state(&state)
                .find_by_email(email.as_str())
                .await?
        }
        Err(_) => None,
    };
    // Unknown accounts still pay for one hash verification.
    let stored_hash = user
        .as_ref()
        .map_or(state.dummy_password_hash.as_str(), |user| {
            user.password_hash.as_str()
        });
    let verified = verify_password(stored_hash, &payload.password);
    let Some(user) = user.filter(|_| verified) else {
        record_auth_failure("invalid_credentials");
        tracing::warn!(event = "auth.signin", outcome = "invalid_credentials");
        return Err(ApiFailure::Unauthorized);
    };

    tracing::info!(event = "auth.signin", outcome = "ok", user_id = %user.id);
    Ok(Json(ApiEnvelope::ok(session_response(&state, &user)?)))
}

pub(crate) async fn signout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    invalidate_all_sessions(&state, auth.user_id).await?;
    Ok(Json(ApiEnvelope::done("Signed out")))
}

/// The caller's account, or `data: null` without a valid session.
pub(crate) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Option<UserResponse>>>, ApiFailure> {
    let Some(auth) = authenticate_optional(&state, &headers).await? else {
        return Ok(Json(ApiEnvelope::ok(None)));
    };
    let user = UserRepository::from_state(&state)
        .find_by_id(auth.user_id)
        .await?
        .map(|user| UserResponse::from_record(&user, &state.storage));
    Ok(Json(ApiEnvelope::ok(user)))
}

pub(crate) async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<ApiEnvelope<SessionResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    validate_password(&payload.new_password)
        .map_err(|_| ApiFailure::InvalidRequest(INVALID_PASSWORD_MESSAGE))?;
    if !verify_password(&auth.password_hash, &payload.current_password) {
        record_auth_failure("invalid_current_password");
        return Err(ApiFailure::InvalidRequest("Current password is incorrect"));
    }
    let password_hash = hash_password(&payload.new_password).map_err(|e| {
        tracing::error!(event = "auth.change_password", error = %e);
        ApiFailure::Internal
    })?;

    let repository = UserRepository::from_state(&state);
    repository
        .update_password(auth.user_id, &password_hash)
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    let user = current_user(&state, &auth).await?;

    tracing::info!(event = "auth.change_password", user_id = %auth.user_id, epoch = user.session_epoch);
    Ok(Json(ApiEnvelope::ok_with_message(
        session_response(&state, &user)?,
        "Password changed",
    )))
}

pub(crate) async fn change_display_name(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChangeDisplayNameRequest>,
) -> Result<Json<ApiEnvelope<UserResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let display_name = DisplayName::try_from(payload.display_name).map_err(|_| {
        ApiFailure::InvalidRequest("Display name must be between 1 and 50 characters")
    })?;
    let updated = UserRepository::from_state(&state)
        .update_display_name(auth.user_id, display_name.as_str())
        .await?;
    if !updated {
        return Err(ApiFailure::Unauthorized);
    }
    let user = current_user(&state, &auth).await?;
    Ok(Json(ApiEnvelope::ok(UserResponse::from_record(
        &user,
        &state.storage,
    ))))
}

pub(crate) async fn change_username(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChangeUsernameRequest>,
) -> Result<Json<ApiEnvelope<UserResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let username = Username::try_from(payload.username).map_err(|_| {
        ApiFailure::InvalidRequest("Username must be 3-20 letters, numbers or underscores")
    })?;
    if username.as_str() == auth.username {
        return Err(ApiFailure::InvalidRequest("This is already your username"));
    }
    let updated = UserRepository::from_state(&state)
        .update_username(auth.user_id, username.as_str())
        .await?;
    if !updated {
        return Err(ApiFailure::Conflict("Username is already taken"));
    }
    let user = current_user(&state, &auth).await?;
    tracing::info!(event = "auth.change_username", user_id = %auth.user_id);
    Ok(Json(ApiEnvelope::ok(UserResponse::from_record(
        &user,
        &state.storage,
    ))))
}

/// Removes the account row only; content the user left behind stays.
pub(crate) async fn delete_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DeleteAccountRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    if !verify_password(&auth.password_hash, &payload.password) {
        record_auth_failure("invalid_delete_password");
        return Err(ApiFailure::InvalidRequest("Incorrect password"));
    }
    let repository = UserRepository::from_state(&state);
    let avatar_key = repository
        .find_by_id(auth.user_id)
        .await?
        .and_then(|user| user.avatar_key);
    if !repository.delete(auth.user_id).await? {
        return Err(ApiFailure::Unauthorized);
    }
    if let Some(key) = avatar_key {
        state.storage.delete_best_effort(&key).await;
    }

    tracing::info!(event = "auth.delete_account", user_id = %auth.user_id);
    Ok(Json(ApiEnvelope::done("Account deleted")))
}

pub(crate) async fn upload_avatar(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ApiEnvelope<UserResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let declared_content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let stored = state
        .storage
        .upload_stream(
            body,
            &UploadPolicy {
                prefix: AVATAR_PREFIX,
                max_bytes: state.runtime.max_image_bytes,
                allowed_mime_types: &IMAGE_MIME_ALLOWLIST,
                declared_content_type,
            },
        )
        .await?;

    let repository = UserRepository::from_state(&state);
    let Some(previous) = repository
        .set_avatar(auth.user_id, Some(&stored.key))
        .await?
    else {
        state.storage.delete_best_effort(&stored.key).await;
        return Err(ApiFailure::Unauthorized);
    };
    if let Some(previous) = previous {
        state.storage.delete_best_effort(&previous).await;
    }
    let user = current_user(&state, &auth).await?;

    tracing::info!(
        event = "auth.upload_avatar",
        user_id = %auth.user_id,
        size = stored.size,
        mime_type = stored.mime_type
    );
    Ok(Json(ApiEnvelope::ok(UserResponse::from_record(
        &user,
        &state.storage,
    ))))
}

pub(crate) async fn delete_avatar(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<UserResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let repository = UserRepository::from_state(&state);
    let previous = repository
        .set_avatar(auth.user_id, None)
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    let Some(previous) = previous else {
        return Err(ApiFailure::InvalidRequest("No avatar to delete"));
    };
    state.storage.delete_best_effort(&previous).await;
    let user = current_user(&state, &auth).await?;
    Ok(Json(ApiEnvelope::ok(UserResponse::from_record(
        &user,
        &state.storage,
    ))))
}
