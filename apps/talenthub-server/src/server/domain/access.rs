use talenthub_core::{ConversationScope, UserId};

use super::{conversation_from_row, workspace::server_member, CONVERSATION_COLUMNS};
use crate::server::{
    core::{AppState, ConversationRecord},
    db::ready_pool,
    errors::ApiFailure,
};

/// A conversation the caller has been admitted to.
#[derive(Debug, Clone)]
pub(crate) struct ConversationAccess {
    pub(crate) conversation: ConversationRecord,
    /// Set when a server moderator muted the caller; muted members may read but not post.
    pub(crate) muted: bool,
}

pub(crate) async fn load_conversation(
    state: &AppState,
    conversation_id: &str,
) -> Result<Option<ConversationRecord>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE conversation_id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(pool)
        .await?;
        return row.as_ref().map(conversation_from_row).transpose();
    }

    Ok(state
        .messenger
        .read()
        .await
        .conversations
        .get(conversation_id)
        .cloned())
}

async fn is_conversation_member(
    state: &AppState,
    conversation_id: &str,
    user_id: UserId,
) -> Result<bool, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(
            "SELECT 1 FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await?;
        return Ok(row.is_some());
    }

    Ok(state
        .messenger
        .read()
        .await
        .members
        .get(conversation_id)
        .is_some_and(|members| members.contains_key(&user_id)))
}

/// Admits `user_id` to a conversation.
///
/// Channel conversations require a membership in the owning server; direct
/// conversations require a conversation membership.
pub(crate) async fn authorize_conversation(
    state: &AppState,
    user_id: UserId,
    conversation_id: &str,
) -> Result<ConversationAccess, ApiFailure> {
    let conversation = load_conversation(state, conversation_id)
        .await?
        .ok_or(ApiFailure::NotFound("Conversation not found"))?;

    let muted = match &conversation.scope {
        ConversationScope::Channel { server_id, .. } => server_member(state, server_id, user_id)
            .await?
            .map(|member| member.muted),
        ConversationScope::Direct { .. } => {
            is_conversation_member(state, conversation_id, user_id)
                .await?
                .then_some(false)
        }
    };
    let Some(muted) = muted else {
        tracing::info!(
            event = "conversations.access",
            outcome = "denied",
            conversation_id = %conversation_id,
            user_id = %user_id,
        );
        return Err(ApiFailure::Forbidden("You do not have access to this conversation"));
    };

    Ok(ConversationAccess {
        conversation,
        muted,
    })
}
