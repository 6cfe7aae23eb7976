use std::collections::{HashMap, HashSet};

use sqlx::{postgres::PgRow, Row};
use talenthub_core::{ConversationKind, ConversationScope, DmKey, MessageKind, UserId};

mod access;
mod membership;
mod message_log;
mod read_state;
mod resolver;
mod workspace;

pub(crate) use access::{authorize_conversation, load_conversation, ConversationAccess};
pub(crate) use membership::{
    ban_member, discover_servers, join_server, member_count, moderation_target,
    regenerate_invite_key, remove_member, server_by_invite, servers_for_user, set_member_muted,
    set_server_icon, update_server, JoinOutcome, ServerChanges,
};
pub(crate) use message_log::{
    append_message, edit_message, list_messages, soft_delete_message, MessageDraft,
    MessageEdit, MessagePage, MessageTombstone,
};
pub(crate) use read_state::{list_conversations, mark_read};
pub(crate) use resolver::{
    resolve_channel_conversation, resolve_or_create_dm, ResolvedChannel, ResolvedDm,
};
pub(crate) use workspace::{
    channel_by_key, channel_in_server, create_channel, create_server, delete_server,
    list_channels, load_server, require_owner, server_member, server_members, ServerMemberRow,
};

use super::{
    core::{AppState, ChannelRecord, ConversationRecord, MessageRecord, ServerRecord},
    errors::ApiFailure,
    types::{AttachmentPayload, MessageResponse, UserSummary},
    user_repository::{UserPersistence, UserRepository},
};

pub(crate) const CONVERSATION_COLUMNS: &str = "conversation_id, kind, server_id, channel_id,
     dm_key, last_message_id, last_message_at_ms, created_at_ms";
pub(crate) const MESSAGE_COLUMNS: &str = "message_id, conversation_id, sender_user_id, content,
     kind, reply_to_message_id, attachments_json, edited_at_ms, deleted_at_ms, created_at_ms";
pub(crate) const CHANNEL_COLUMNS: &str = "channel_id, server_id, name, channel_key, created_at_ms";
pub(crate) const SERVER_COLUMNS: &str =
    "server_id, name, icon_key, owner_user_id, is_public, invite_key, created_at_ms";

pub(crate) fn conversation_from_row(row: &PgRow) -> Result<ConversationRecord, ApiFailure> {
    let kind: i16 = row.try_get("kind")?;
    let scope = match ConversationKind::from_i16(kind).ok_or(ApiFailure::Internal)? {
        ConversationKind::Channel => {
            let server_id: Option<String> = row.try_get("server_id")?;
            ConversationScope::Channel {
                server_id: server_id.ok_or(ApiFailure::Internal)?,
                channel_id: row.try_get("channel_id")?,
            }
        }
        ConversationKind::Direct => {
            let dm_key: Option<String> = row.try_get("dm_key")?;
            let dm_key = dm_key.ok_or(ApiFailure::Internal)?;
            ConversationScope::Direct {
                dm_key: DmKey::try_from(dm_key).map_err(|_| ApiFailure::Internal)?,
            }
        }
    };
    Ok(ConversationRecord {
        conversation_id: row.try_get("conversation_id")?,
        scope,
        last_message_id: row.try_get("last_message_id")?,
        last_message_at_ms: row.try_get("last_message_at_ms")?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

pub(crate) fn message_from_row(row: &PgRow) -> Result<MessageRecord, ApiFailure> {
    let sender_user_id: String = row.try_get("sender_user_id")?;
    let kind: String = row.try_get("kind")?;
    let attachments_json: String = row.try_get("attachments_json")?;
    let attachments: Vec<AttachmentPayload> =
        serde_json::from_str(&attachments_json).map_err(|e| {
            tracing::error!(event = "messages.decode", error = %e);
            ApiFailure::Internal
        })?;
    Ok(MessageRecord {
        message_id: row.try_get("message_id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: UserId::try_from(sender_user_id).map_err(|_| ApiFailure::Internal)?,
        content: row.try_get("content")?,
        kind: MessageKind::try_from(kind).map_err(|_| ApiFailure::Internal)?,
        reply_to_message_id: row.try_get("reply_to_message_id")?,
        attachments,
        edited_at_ms: row.try_get("edited_at_ms")?,
        deleted_at_ms: row.try_get("deleted_at_ms")?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

pub(crate) fn channel_from_row(row: &PgRow) -> Result<ChannelRecord, ApiFailure> {
    Ok(ChannelRecord {
        channel_id: row.try_get("channel_id")?,
        server_id: row.try_get("server_id")?,
        name: row.try_get("name")?,
        channel_key: row.try_get("channel_key")?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

pub(crate) fn server_from_row(row: &PgRow) -> Result<ServerRecord, ApiFailure> {
    let owner_user_id: String = row.try_get("owner_user_id")?;
    Ok(ServerRecord {
        server_id: row.try_get("server_id")?,
        name: row.try_get("name")?,
        icon_key: row.try_get("icon_key")?,
        owner_id: UserId::try_from(owner_user_id).map_err(|_| ApiFailure::Internal)?,
        is_public: row.try_get("is_public")?,
        invite_key: row.try_get("invite_key")?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

/// Public summaries of the users that still exist among `user_ids`.
pub(crate) async fn user_summaries(
    state: &AppState,
    user_ids: impl IntoIterator<Item = UserId>,
) -> Result<HashMap<UserId, UserSummary>, ApiFailure> {
    let unique: HashSet<UserId> = user_ids.into_iter().collect();
    if unique.is_empty() {
        return Ok(HashMap::new());
    }
    let user_ids: Vec<UserId> = unique.into_iter().collect();
    let users = UserRepository::from_state(state).find_many(&user_ids).await?;
    Ok(users
        .into_iter()
        .map(|(user_id, user)| (user_id, UserSummary::from_record(&user, &state.storage)))
        .collect())
}

/// Inlines sender profiles; senders whose account is gone stay `None`.
pub(crate) async fn hydrate_messages(
    state: &AppState,
    messages: &[MessageRecord],
) -> Result<Vec<MessageResponse>, ApiFailure> {
    let senders = user_summaries(state, messages.iter().map(|message| message.sender_id)).await?;
    Ok(messages
        .iter()
        .map(|message| MessageResponse::from_record(message, senders.get(&message.sender_id).cloned()))
        .collect())
}

pub(crate) fn parse_user_id(value: String) -> Result<UserId, ApiFailure> {
    UserId::try_from(value).map_err(|_| ApiFailure::InvalidRequest("Invalid user id"))
}
