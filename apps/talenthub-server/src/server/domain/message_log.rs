use sqlx::Row;
use talenthub_core::{
    clamp_page_limit, normalize_message_content, split_page, DomainError, MessageKind,
    PageCursor, UserId,
};
use talenthub_protocol::{MESSAGE_DELETED_EVENT, MESSAGE_EDITED_EVENT, MESSAGE_NEW_EVENT};
use ulid::Ulid;

use super::{access::authorize_conversation, hydrate_messages, message_from_row, MESSAGE_COLUMNS};
use crate::server::{
    auth::now_unix_ms,
    core::{AppState, MessageRecord},
    db::ready_pool,
    errors::ApiFailure,
    gateway_events::{try_message_deleted, try_message_edited, try_message_new},
    metrics::record_side_effect_failure,
    realtime::publish_conversation_event,
    storage::ATTACHMENT_PREFIX,
    types::{AttachmentPayload, MessageResponse},
};

pub(crate) const MAX_ATTACHMENTS_PER_MESSAGE: usize = 10;
const MAX_ATTACHMENT_NAME_CHARS: usize = 255;

#[derive(Debug, Clone)]
pub(crate) struct MessageDraft {
    pub(crate) conversation_id: String,
    pub(crate) content: String,
    pub(crate) reply_to_message_id: Option<String>,
    pub(crate) attachments: Vec<AttachmentPayload>,
}

#[derive(Debug)]
pub(crate) struct MessagePage {
    pub(crate) messages: Vec<MessageResponse>,
    pub(crate) next_cursor: Option<PageCursor>,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageEdit {
    pub(crate) message_id: String,
    pub(crate) conversation_id: String,
    pub(crate) content: String,
    pub(crate) edited_at_ms: i64,
}

/// Outcome of a soft delete. `newly_deleted` is false on repeated deletes,
/// which keep the first `deleted_at_ms`.
#[derive(Debug, Clone)]
pub(crate) struct MessageTombstone {
    pub(crate) message_id: String,
    pub(crate) conversation_id: String,
    pub(crate) deleted_at_ms: i64,
    pub(crate) newly_deleted: bool,
}

fn content_failure(error: DomainError) -> ApiFailure {
    match error {
        DomainError::MessageTooLong => ApiFailure::InvalidRequest("Message is too long"),
        _ => ApiFailure::InvalidRequest("Message must have content or attachments"),
    }
}

fn validate_attachments(
    state: &AppState,
    attachments: &[AttachmentPayload],
) -> Result<(), ApiFailure> {
    if attachments.len() > MAX_ATTACHMENTS_PER_MESSAGE {
        return Err(ApiFailure::InvalidRequest("Too many attachments"));
    }
    let attachment_prefix = format!("{ATTACHMENT_PREFIX}/");
    for attachment in attachments {
        let owned_by_us = state
            .storage
            .key_for_public_url(&attachment.url)
            .is_some_and(|key| key.starts_with(&attachment_prefix));
        let name_len = attachment.name.chars().count();
        if !owned_by_us
            || name_len == 0
            || name_len > MAX_ATTACHMENT_NAME_CHARS
            || attachment.mime_type.is_empty()
        {
            return Err(ApiFailure::InvalidRequest("Invalid attachment"));
        }
    }
    Ok(())
}

pub(super) async fn find_message(
    state: &AppState,
    message_id: &str,
) -> Result<Option<MessageRecord>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(pool)
        .await?;
        return row.as_ref().map(message_from_row).transpose();
    }

    Ok(state.messenger.read().await.messages.get(message_id).cloned())
}

async fn insert_message(state: &AppState, message: &MessageRecord) -> Result<(), ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let attachments_json = serde_json::to_string(&message.attachments).map_err(|e| {
            tracing::error!(event = "messages.encode", error = %e);
            ApiFailure::Internal
        })?;
        sqlx::query(
            "INSERT INTO messages (message_id, conversation_id, sender_user_id, content, kind,
                                   reply_to_message_id, attachments_json, created_at_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&message.message_id)
        .bind(&message.conversation_id)
        .bind(message.sender_id.to_string())
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.reply_to_message_id.as_deref())
        .bind(attachments_json)
        .bind(message.created_at_ms)
        .execute(pool)
        .await?;
        return Ok(());
    }

    let mut messenger = state.messenger.write().await;
    if !messenger
        .conversations
        .contains_key(&message.conversation_id)
    {
        return Err(ApiFailure::NotFound("Conversation not found"));
    }
    messenger
        .timeline
        .entry(message.conversation_id.clone())
        .or_default()
        .push(message.message_id.clone());
    messenger
        .messages
        .insert(message.message_id.clone(), message.clone());
    Ok(())
}

/// Moves the conversation's activity marker forward. Runs after the message
/// is stored; a failure leaves the marker stale until the next message.
async fn touch_last_message(state: &AppState, message: &MessageRecord) {
    let outcome = async {
        if let Some(pool) = ready_pool(state).await? {
            sqlx::query(
                "UPDATE conversations
                 SET last_message_id = $2, last_message_at_ms = $3
                 WHERE conversation_id = $1
                   AND (last_message_at_ms IS NULL OR last_message_at_ms <= $3)",
            )
            .bind(&message.conversation_id)
            .bind(&message.message_id)
            .bind(message.created_at_ms)
            .execute(pool)
            .await?;
            return Ok::<(), ApiFailure>(());
        }

        let mut messenger = state.messenger.write().await;
        if let Some(conversation) = messenger.conversations.get_mut(&message.conversation_id) {
            if conversation
                .last_message_at_ms
                .is_none_or(|last| last <= message.created_at_ms)
            {
                conversation.last_message_id = Some(message.message_id.clone());
                conversation.last_message_at_ms = Some(message.created_at_ms);
            }
        }
        Ok(())
    }
    .await;

    if let Err(error) = outcome {
        record_side_effect_failure("store", "touch_last_message");
        tracing::warn!(
            event = "messages.touch_last_message",
            conversation_id = %message.conversation_id,
            message_id = %message.message_id,
            error = ?error,
        );
    }
}

/// Appends a message to the conversation log and publishes `message:new`.
pub(crate) async fn append_message(
    state: &AppState,
    sender_id: UserId,
    draft: MessageDraft,
) -> Result<MessageResponse, ApiFailure> {
    let access = authorize_conversation(state, sender_id, &draft.conversation_id).await?;
    if access.muted {
        return Err(ApiFailure::Forbidden("You are muted in this server"));
    }
    let content = normalize_message_content(&draft.content, !draft.attachments.is_empty())
        .map_err(content_failure)?;
    validate_attachments(state, &draft.attachments)?;
    if let Some(reply_to) = draft.reply_to_message_id.as_deref() {
        let target = find_message(state, reply_to).await?;
        if target.is_none_or(|target| target.conversation_id != draft.conversation_id) {
            return Err(ApiFailure::InvalidRequest("Reply target not found"));
        }
    }

    let kind = MessageKind::for_first_attachment(
        draft
            .attachments
            .first()
            .map(|attachment| attachment.mime_type.as_str()),
    );
    let message = MessageRecord {
        message_id: Ulid::new().to_string(),
        conversation_id: draft.conversation_id,
        sender_id,
        content,
        kind,
        reply_to_message_id: draft.reply_to_message_id,
        attachments: draft.attachments,
        edited_at_ms: None,
        deleted_at_ms: None,
        created_at_ms: now_unix_ms(),
    };
    insert_message(state, &message).await?;
    touch_last_message(state, &message).await;

    let response = hydrate_messages(state, std::slice::from_ref(&message))
        .await?
        .pop()
        .ok_or(ApiFailure::Internal)?;
    publish_conversation_event(
        state,
        &message.conversation_id,
        MESSAGE_NEW_EVENT,
        try_message_new(&response),
    )
    .await;
    tracing::info!(
        event = "messages.send",
        conversation_id = %message.conversation_id,
        message_id = %message.message_id,
        sender_id = %sender_id,
        kind = message.kind.as_str(),
    );
    Ok(response)
}

/// Newest-first page of a conversation's log.
///
/// Rows are fetched with `limit + 1` so the presence of an older page is
/// known without a count query.
pub(crate) async fn list_messages(
    state: &AppState,
    viewer_id: UserId,
    conversation_id: &str,
    limit: Option<usize>,
    cursor: Option<PageCursor>,
) -> Result<MessagePage, ApiFailure> {
    authorize_conversation(state, viewer_id, conversation_id).await?;
    let limit = clamp_page_limit(limit);
    let before = cursor.map(|cursor| cursor.before_created_at);

    let rows = if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = $1
               AND ($2::BIGINT IS NULL OR created_at_ms < $2)
             ORDER BY created_at_ms DESC, message_id DESC
             LIMIT $3"
        ))
        .bind(conversation_id)
        .bind(before)
        .bind(i64::try_from(limit + 1).map_err(|_| ApiFailure::Internal)?)
        .fetch_all(pool)
        .await?;
        rows.iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let messenger = state.messenger.read().await;
        let mut rows: Vec<MessageRecord> = messenger
            .timeline
            .get(conversation_id)
            .into_iter()
            .flatten()
            .filter_map(|message_id| messenger.messages.get(message_id))
            .filter(|message| before.is_none_or(|before| message.created_at_ms < before))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.message_id.cmp(&a.message_id))
        });
        rows.truncate(limit + 1);
        rows
    };

    let (rows, next_cursor) = split_page(rows, limit, |message| message.created_at_ms);
    Ok(MessagePage {
        messages: hydrate_messages(state, &rows).await?,
        next_cursor,
    })
}

/// Resolves a message the caller wants to change, enforcing sender ownership.
async fn owned_message(
    state: &AppState,
    actor_id: UserId,
    message_id: &str,
    denied: &'static str,
) -> Result<MessageRecord, ApiFailure> {
    let message = find_message(state, message_id)
        .await?
        .ok_or(ApiFailure::NotFound("Message not found"))?;
    if message.sender_id != actor_id {
        tracing::info!(
            event = "messages.ownership",
            outcome = "denied",
            message_id = %message_id,
            user_id = %actor_id,
        );
        return Err(ApiFailure::Forbidden(denied));
    }
    Ok(message)
}

pub(crate) async fn edit_message(
    state: &AppState,
    editor_id: UserId,
    message_id: &str,
    content: &str,
) -> Result<MessageEdit, ApiFailure> {
    let message = owned_message(
        state,
        editor_id,
        message_id,
        "You can only edit your own messages",
    )
    .await?;
    if message.deleted_at_ms.is_some() {
        return Err(ApiFailure::InvalidRequest("Deleted messages cannot be edited"));
    }
    let content = normalize_message_content(content, false).map_err(|error| match error {
        DomainError::EmptyMessage => ApiFailure::InvalidRequest("Content is required"),
        other => content_failure(other),
    })?;
    let edited_at_ms = now_unix_ms();

    let updated = if let Some(pool) = ready_pool(state).await? {
        sqlx::query(
            "UPDATE messages SET content = $2, edited_at_ms = $3
             WHERE message_id = $1 AND deleted_at_ms IS NULL",
        )
        .bind(message_id)
        .bind(&content)
        .bind(edited_at_ms)
        .execute(pool)
        .await?
        .rows_affected()
            > 0
    } else {
        let mut messenger = state.messenger.write().await;
        match messenger.messages.get_mut(message_id) {
            Some(stored) if stored.deleted_at_ms.is_none() => {
                stored.content.clone_from(&content);
                stored.edited_at_ms = Some(edited_at_ms);
                true
            }
            _ => false,
        }
    };
    if !updated {
        return Err(ApiFailure::InvalidRequest("Deleted messages cannot be edited"));
    }

    publish_conversation_event(
        state,
        &message.conversation_id,
        MESSAGE_EDITED_EVENT,
        try_message_edited(&message.conversation_id, message_id, &content, edited_at_ms),
    )
    .await;
    tracing::info!(
        event = "messages.edit",
        conversation_id = %message.conversation_id,
        message_id = %message_id,
    );
    Ok(MessageEdit {
        message_id: message.message_id,
        conversation_id: message.conversation_id,
        content,
        edited_at_ms,
    })
}

/// Tombstones a message. Content is cleared; attachment references and the
/// stored files are kept.
pub(crate) async fn soft_delete_message(
    state: &AppState,
    actor_id: UserId,
    message_id: &str,
) -> Result<MessageTombstone, ApiFailure> {
    let message = owned_message(
        state,
        actor_id,
        message_id,
        "You can only delete your own messages",
    )
    .await?;
    if let Some(deleted_at_ms) = message.deleted_at_ms {
        return Ok(MessageTombstone {
            message_id: message.message_id,
            conversation_id: message.conversation_id,
            deleted_at_ms,
            newly_deleted: false,
        });
    }
    let now = now_unix_ms();

    let (deleted_at_ms, newly_deleted) = if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(
            "UPDATE messages
             SET kind = $2, content = '', deleted_at_ms = $3
             WHERE message_id = $1 AND deleted_at_ms IS NULL
             RETURNING deleted_at_ms",
        )
        .bind(message_id)
        .bind(MessageKind::Deleted.as_str())
        .bind(now)
        .fetch_optional(pool)
        .await?;
        match row {
            Some(row) => (row.try_get::<i64, _>("deleted_at_ms")?, true),
            None => {
                let current = find_message(state, message_id)
                    .await?
                    .ok_or(ApiFailure::NotFound("Message not found"))?;
                (current.deleted_at_ms.ok_or(ApiFailure::Internal)?, false)
            }
        }
    } else {
        let mut messenger = state.messenger.write().await;
        let stored = messenger
            .messages
            .get_mut(message_id)
            .ok_or(ApiFailure::NotFound("Message not found"))?;
        match stored.deleted_at_ms {
            Some(existing) => (existing, false),
            None => {
                stored.kind = MessageKind::Deleted;
                stored.content.clear();
                stored.deleted_at_ms = Some(now);
                (now, true)
            }
        }
    };

    if newly_deleted {
        publish_conversation_event(
            state,
            &message.conversation_id,
            MESSAGE_DELETED_EVENT,
            try_message_deleted(&message.conversation_id, message_id, deleted_at_ms),
        )
        .await;
        tracing::info!(
            event = "messages.delete",
            conversation_id = %message.conversation_id,
            message_id = %message_id,
        );
    }
    Ok(MessageTombstone {
        message_id: message.message_id,
        conversation_id: message.conversation_id,
        deleted_at_ms,
        newly_deleted,
    })
}
