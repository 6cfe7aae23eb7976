use axum::{extract::State, http::HeaderMap, Json};
use sqlx::{postgres::PgRow, Row};
use talenthub_core::{pair_key, Email, FriendRequestStatus, FriendshipStatus, UserId, Username};
use talenthub_protocol::ApiEnvelope;
use ulid::Ulid;

use crate::server::{
    auth::{authenticate, now_unix_ms},
    core::{AppState, FriendRequestRecord, UserRecord},
    db::{is_unique_violation, ready_pool},
    domain::{parse_user_id, user_summaries},
    errors::ApiFailure,
    types::{
        FriendAction, FriendRemoveRequest, FriendRequestDirection, FriendRequestResponse,
        FriendRequestsRequest, FriendRespondRequest, FriendResponse, FriendSendRequest,
        FriendStatusRequest, FriendStatusResponse,
    },
    user_repository::{UserPersistence, UserRepository},
};

const FRIEND_REQUEST_COLUMNS: &str =
    "request_id, sender_user_id, receiver_user_id, pair_key, status, created_at_ms";

fn friend_request_from_row(row: &PgRow) -> Result<FriendRequestRecord, ApiFailure> {
    let sender: String = row.try_get("sender_user_id")?;
    let receiver: String = row.try_get("receiver_user_id")?;
    let status: String = row.try_get("status")?;
    Ok(FriendRequestRecord {
        request_id: row.try_get("request_id")?,
        sender_id: UserId::try_from(sender).map_err(|_| ApiFailure::Internal)?,
        receiver_id: UserId::try_from(receiver).map_err(|_| ApiFailure::Internal)?,
        pair_key: row.try_get("pair_key")?,
        status: FriendRequestStatus::try_from(status).map_err(|_| ApiFailure::Internal)?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

/// The single request row linking a pair, whatever its direction.
async fn request_for_pair(
    state: &AppState,
    pair: &str,
) -> Result<Option<FriendRequestRecord>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!(
            "SELECT {FRIEND_REQUEST_COLUMNS} FROM friend_requests WHERE pair_key = $1"
        ))
        .bind(pair)
        .fetch_optional(pool)
        .await?;
        return row.as_ref().map(friend_request_from_row).transpose();
    }
    Ok(state
        .friend_requests
        .read()
        .await
        .values()
        .find(|request| request.pair_key == pair)
        .cloned())
}

/// Email when the query contains `@`, username otherwise.
async fn find_by_query(state: &AppState, query: String) -> Result<Option<UserRecord>, ApiFailure> {
    let repository = UserRepository::from_state(state);
    if query.contains('@') {
        let Ok(email) = Email::try_from(query) else {
            return Ok(None);
        };
        return repository.find_by_email(email.as_str()).await;
    }
    let Ok(username) = Username::try_from(query) else {
        return Ok(None);
    };
    repository.find_by_username(username.as_str()).await
}

async fn request_responses(
    state: &AppState,
    requests: Vec<FriendRequestRecord>,
) -> Result<Vec<FriendRequestResponse>, ApiFailure> {
    let users = user_summaries(
        state,
        requests
            .iter()
            .flat_map(|request| [request.sender_id, request.receiver_id]),
    )
    .await?;
    Ok(requests
        .into_iter()
        .map(|request| FriendRequestResponse {
            id: request.request_id,
            sender_id: request.sender_id.to_string(),
            receiver_id: request.receiver_id.to_string(),
            sender: users.get(&request.sender_id).cloned(),
            receiver: users.get(&request.receiver_id).cloned(),
            status: request.status,
            created_at: request.created_at_ms,
        })
        .collect())
}

pub(crate) async fn send_friend_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FriendSendRequest>,
) -> Result<Json<ApiEnvelope<FriendRequestResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let query = payload.query.trim().to_owned();
    if query.is_empty() {
        return Err(ApiFailure::InvalidRequest(
            "query (email or username) is required",
        ));
    }
    let target = find_by_query(&state, query)
        .await?
        .ok_or(ApiFailure::NotFound("User not found"))?;
    if target.id == auth.user_id {
        return Err(ApiFailure::InvalidRequest(
            "You cannot send a friend request to yourself",
        ));
    }
    let pair = pair_key(auth.user_id, target.id).map_err(|_| ApiFailure::Internal)?;
    let request = FriendRequestRecord {
        request_id: Ulid::new().to_string(),
        sender_id: auth.user_id,
        receiver_id: target.id,
        pair_key: pair,
        status: FriendRequestStatus::Pending,
        created_at_ms: now_unix_ms(),
    };

    if let Some(pool) = ready_pool(&state).await? {
        let mut tx = pool.begin().await?;
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT status FROM friend_requests WHERE pair_key = $1 FOR UPDATE",
        )
        .bind(&request.pair_key)
        .fetch_optional(&mut *tx)
        .await?;
        match existing.as_deref() {
            Some("accepted") => return Err(ApiFailure::Conflict("You are already friends")),
            Some("pending") => {
                return Err(ApiFailure::Conflict("A friend request already exists"))
            }
            Some(_) => {
                sqlx::query("DELETE FROM friend_requests WHERE pair_key = $1")
                    .bind(&request.pair_key)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {}
        }
        let inserted = sqlx::query(
            "INSERT INTO friend_requests
                (request_id, sender_user_id, receiver_user_id, pair_key, status, created_at_ms)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&request.request_id)
        .bind(request.sender_id.to_string())
        .bind(request.receiver_id.to_string())
        .bind(&request.pair_key)
        .bind(request.status.as_str())
        .bind(request.created_at_ms)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => tx.commit().await?,
            Err(error) if is_unique_violation(&error) => {
                return Err(ApiFailure::Conflict("A friend request already exists"));
            }
            Err(error) => return Err(error.into()),
        }
    } else {
        let mut requests = state.friend_requests.write().await;
        let existing = requests
            .values()
            .find(|existing| existing.pair_key == request.pair_key)
            .map(|existing| (existing.request_id.clone(), existing.status));
        match existing {
            Some((_, FriendRequestStatus::Accepted)) => {
                return Err(ApiFailure::Conflict("You are already friends"));
            }
            Some((_, FriendRequestStatus::Pending)) => {
                return Err(ApiFailure::Conflict("A friend request already exists"));
            }
            Some((stale_id, FriendRequestStatus::Denied)) => {
                requests.remove(&stale_id);
            }
            None => {}
        }
        requests.insert(request.request_id.clone(), request.clone());
    }

    tracing::info!(
        event = "friends.send",
        request_id = %request.request_id,
        sender_id = %request.sender_id,
        receiver_id = %request.receiver_id
    );
    let mut responses = request_responses(&state, vec![request]).await?;
    let response = responses.pop().ok_or(ApiFailure::Internal)?;
    Ok(Json(ApiEnvelope::ok_with_message(
        response,
        "Friend request sent",
    )))
}

pub(crate) async fn respond_friend_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FriendRespondRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let next_status = match payload.action {
        FriendAction::Accept => FriendRequestStatus::Accepted,
        FriendAction::Deny => FriendRequestStatus::Denied,
    };

    let updated = if let Some(pool) = ready_pool(&state).await? {
        let row = sqlx::query(&format!(
            "SELECT {FRIEND_REQUEST_COLUMNS} FROM friend_requests WHERE request_id = $1"
        ))
        .bind(&payload.request_id)
        .fetch_optional(pool)
        .await?;
        let request = row
            .as_ref()
            .map(friend_request_from_row)
            .transpose()?
            .ok_or(ApiFailure::NotFound("Request not found"))?;
        if request.receiver_id != auth.user_id {
            return Err(ApiFailure::Forbidden("Not authorized"));
        }
        sqlx::query(
            "UPDATE friend_requests SET status = $2
             WHERE request_id = $1 AND status = 'pending'",
        )
        .bind(&payload.request_id)
        .bind(next_status.as_str())
        .execute(pool)
        .await?
        .rows_affected()
            > 0
    } else {
        let mut requests = state.friend_requests.write().await;
        let request = requests
            .get_mut(&payload.request_id)
            .ok_or(ApiFailure::NotFound("Request not found"))?;
        if request.receiver_id != auth.user_id {
            return Err(ApiFailure::Forbidden("Not authorized"));
        }
        if request.status == FriendRequestStatus::Pending {
            request.status = next_status;
            true
        } else {
            false
        }
    };
    if !updated {
        return Err(ApiFailure::InvalidRequest("Request is no longer pending"));
    }

    tracing::info!(
        event = "friends.respond",
        request_id = %payload.request_id,
        status = next_status.as_str()
    );
    Ok(Json(ApiEnvelope::done(match payload.action {
        FriendAction::Accept => "Friend request accepted",
        FriendAction::Deny => "Friend request denied",
    })))
}

/// Pending requests the caller received or sent, newest first.
pub(crate) async fn list_friend_requests(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FriendRequestsRequest>,
) -> Result<Json<ApiEnvelope<Vec<FriendRequestResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let requests = if let Some(pool) = ready_pool(&state).await? {
        let column = match payload.direction {
            FriendRequestDirection::Received => "receiver_user_id",
            FriendRequestDirection::Sent => "sender_user_id",
        };
        let rows = sqlx::query(&format!(
            "SELECT {FRIEND_REQUEST_COLUMNS} FROM friend_requests
             WHERE {column} = $1 AND status = 'pending'
             ORDER BY created_at_ms DESC"
        ))
        .bind(auth.user_id.to_string())
        .fetch_all(pool)
        .await?;
        rows.iter()
            .map(friend_request_from_row)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let mut requests: Vec<FriendRequestRecord> = state
            .friend_requests
            .read()
            .await
            .values()
            .filter(|request| request.status == FriendRequestStatus::Pending)
            .filter(|request| match payload.direction {
                FriendRequestDirection::Received => request.receiver_id == auth.user_id,
                FriendRequestDirection::Sent => request.sender_id == auth.user_id,
            })
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        requests
    };
    Ok(Json(ApiEnvelope::ok(
        request_responses(&state, requests).await?,
    )))
}

/// Accepted friends; friends whose account is gone are left out.
pub(crate) async fn list_friends(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<FriendResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let accepted = if let Some(pool) = ready_pool(&state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {FRIEND_REQUEST_COLUMNS} FROM friend_requests
             WHERE (sender_user_id = $1 OR receiver_user_id = $1) AND status = 'accepted'
             ORDER BY created_at_ms DESC"
        ))
        .bind(auth.user_id.to_string())
        .fetch_all(pool)
        .await?;
        rows.iter()
            .map(friend_request_from_row)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let mut accepted: Vec<FriendRequestRecord> = state
            .friend_requests
            .read()
            .await
            .values()
            .filter(|request| {
                request.status == FriendRequestStatus::Accepted
                    && (request.sender_id == auth.user_id || request.receiver_id == auth.user_id)
            })
            .cloned()
            .collect();
        accepted.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        accepted
    };

    let friend_of = |request: &FriendRequestRecord| {
        if request.sender_id == auth.user_id {
            request.receiver_id
        } else {
            request.sender_id
        }
    };
    let users = user_summaries(&state, accepted.iter().map(friend_of)).await?;
    let friends = accepted
        .iter()
        .filter_map(|request| {
            let user = users.get(&friend_of(request))?.clone();
            Some(FriendResponse {
                user,
                since: request.created_at_ms,
            })
        })
        .collect();
    Ok(Json(ApiEnvelope::ok(friends)))
}

pub(crate) async fn remove_friend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FriendRemoveRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let friend_id = parse_user_id(payload.friend_id)?;
    let pair = pair_key(auth.user_id, friend_id)
        .map_err(|_| ApiFailure::NotFound("Friendship not found"))?;

    let removed = if let Some(pool) = ready_pool(&state).await? {
        sqlx::query("DELETE FROM friend_requests WHERE pair_key = $1 AND status = 'accepted'")
            .bind(&pair)
            .execute(pool)
            .await?
            .rows_affected()
            > 0
    } else {
        let mut requests = state.friend_requests.write().await;
        let before = requests.len();
        requests.retain(|_, request| {
            !(request.pair_key == pair && request.status == FriendRequestStatus::Accepted)
        });
        requests.len() < before
    };
    if !removed {
        return Err(ApiFailure::NotFound("Friendship not found"));
    }

    tracing::info!(event = "friends.remove", user_id = %auth.user_id, friend_id = %friend_id);
    Ok(Json(ApiEnvelope::done("Friend removed")))
}

pub(crate) async fn friend_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FriendStatusRequest>,
) -> Result<Json<ApiEnvelope<FriendStatusResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let other = parse_user_id(payload.other_user_id)?;
    let Ok(pair) = pair_key(auth.user_id, other) else {
        return Ok(Json(ApiEnvelope::ok(FriendStatusResponse {
            status: FriendshipStatus::None,
        })));
    };
    let request = request_for_pair(&state, &pair).await?;
    let status = FriendshipStatus::derive(
        auth.user_id,
        request.map(|request| (request.sender_id, request.status)),
    );
    Ok(Json(ApiEnvelope::ok(FriendStatusResponse { status })))
}
