use std::collections::{HashMap, HashSet};

use sqlx::Row;
use talenthub_core::{is_unread, ChannelName, ConversationKind, ConversationScope, UserId};

use super::{
    access::authorize_conversation, conversation_from_row, message_log::find_message,
    user_summaries, CONVERSATION_COLUMNS,
};
use crate::server::{
    auth::now_unix_ms,
    core::{AppState, ConversationMemberRecord, ConversationRecord, MAX_LISTED_CONVERSATIONS},
    db::ready_pool,
    errors::ApiFailure,
    types::{ConversationSummaryResponse, ReadMarkResponse},
};

/// Display facts about a channel needed to title its conversation.
struct ChannelLabel {
    name: String,
    icon_key: Option<String>,
}

/// Records that `user_id` has read `conversation_id` up to `message_id`.
pub(crate) async fn mark_read(
    state: &AppState,
    user_id: UserId,
    conversation_id: &str,
    message_id: &str,
) -> Result<ReadMarkResponse, ApiFailure> {
    authorize_conversation(state, user_id, conversation_id).await?;
    let belongs = find_message(state, message_id)
        .await?
        .is_some_and(|message| message.conversation_id == conversation_id);
    if !belongs {
        return Err(ApiFailure::NotFound("Message not found"));
    }
    let now = now_unix_ms();

    if let Some(pool) = ready_pool(state).await? {
        sqlx::query(
            "INSERT INTO conversation_members
                 (conversation_id, user_id, last_read_message_id, last_read_at_ms, joined_at_ms)
             VALUES ($1, $2, $3, $4, $4)
             ON CONFLICT (conversation_id, user_id) DO UPDATE
             SET last_read_message_id = EXCLUDED.last_read_message_id,
                 last_read_at_ms = EXCLUDED.last_read_at_ms",
        )
        .bind(conversation_id)
        .bind(user_id.to_string())
        .bind(message_id)
        .bind(now)
        .execute(pool)
        .await?;
    } else {
        let mut messenger = state.messenger.write().await;
        let member = messenger
            .members
            .entry(conversation_id.to_owned())
            .or_default()
            .entry(user_id)
            .or_insert_with(|| ConversationMemberRecord {
                joined_at_ms: now,
                ..Default::default()
            });
        member.last_read_message_id = Some(message_id.to_owned());
        member.last_read_at_ms = Some(now);
    }

    Ok(ReadMarkResponse {
        conversation_id: conversation_id.to_owned(),
        last_read_message_id: message_id.to_owned(),
        last_read_at: now,
    })
}

/// The caller's conversations with their read marks, most recently active first.
///
/// Channel conversations of servers the caller no longer belongs to are left out.
async fn memberships(
    state: &AppState,
    user_id: UserId,
) -> Result<Vec<(ConversationRecord, Option<i64>)>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS}, last_read_at_ms
             FROM conversation_members
             JOIN conversations USING (conversation_id)
             WHERE conversation_members.user_id = $1
               AND (conversations.kind = $3
                    OR EXISTS (SELECT 1 FROM server_members
                               WHERE server_members.server_id = conversations.server_id
                                 AND server_members.user_id = conversation_members.user_id))
             ORDER BY last_message_at_ms DESC NULLS LAST, created_at_ms DESC
             LIMIT $2"
        ))
        .bind(user_id.to_string())
        .bind(i64::try_from(MAX_LISTED_CONVERSATIONS).map_err(|_| ApiFailure::Internal)?)
        .bind(ConversationKind::Direct.as_i16())
        .fetch_all(pool)
        .await?;
        return rows
            .iter()
            .map(|row| -> Result<_, ApiFailure> {
                Ok((conversation_from_row(row)?, row.try_get("last_read_at_ms")?))
            })
            .collect();
    }

    let joined_servers: HashSet<String> = state
        .workspace
        .read()
        .await
        .members
        .iter()
        .filter(|(_, members)| members.contains_key(&user_id))
        .map(|(server_id, _)| server_id.clone())
        .collect();
    let messenger = state.messenger.read().await;
    let mut rows: Vec<(ConversationRecord, Option<i64>)> = messenger
        .members
        .iter()
        .filter_map(|(conversation_id, members)| {
            let member = members.get(&user_id)?;
            let conversation = messenger.conversations.get(conversation_id)?;
            if let ConversationScope::Channel { server_id, .. } = &conversation.scope {
                if !joined_servers.contains(server_id) {
                    return None;
                }
            }
            Some((conversation.clone(), member.last_read_at_ms))
        })
        .collect();
    rows.sort_by(|(a, _), (b, _)| activity_order(a, b));
    rows.truncate(MAX_LISTED_CONVERSATIONS);
    Ok(rows)
}

/// Most recent activity first; conversations without messages last.
fn activity_order(a: &ConversationRecord, b: &ConversationRecord) -> std::cmp::Ordering {
    match (a.last_message_at_ms, b.last_message_at_ms) {
        (Some(a_at), Some(b_at)) => b_at.cmp(&a_at),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
    .then_with(|| b.created_at_ms.cmp(&a.created_at_ms))
}

async fn channel_labels(
    state: &AppState,
    channel_ids: Vec<String>,
) -> Result<HashMap<String, ChannelLabel>, ApiFailure> {
    if channel_ids.is_empty() {
        return Ok(HashMap::new());
    }
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(
            "SELECT channels.channel_id, channels.name, servers.icon_key
             FROM channels
             JOIN servers ON servers.server_id = channels.server_id
             WHERE channels.channel_id = ANY($1)",
        )
        .bind(&channel_ids)
        .fetch_all(pool)
        .await?;
        return rows
            .iter()
            .map(|row| -> Result<_, ApiFailure> {
                Ok((
                    row.try_get("channel_id")?,
                    ChannelLabel {
                        name: row.try_get("name")?,
                        icon_key: row.try_get("icon_key")?,
                    },
                ))
            })
            .collect();
    }

    let workspace = state.workspace.read().await;
    Ok(channel_ids
        .into_iter()
        .filter_map(|channel_id| {
            let channel = workspace.channels.get(&channel_id)?;
            let server = workspace.servers.get(&channel.server_id)?;
            let label = ChannelLabel {
                name: channel.name.clone(),
                icon_key: server.icon_key.clone(),
            };
            Some((channel_id, label))
        })
        .collect())
}

/// Conversation list of `user_id` with titles, avatars and unread flags.
///
/// Direct conversations whose other participant is gone and channel
/// conversations whose channel is gone are left out.
pub(crate) async fn list_conversations(
    state: &AppState,
    user_id: UserId,
) -> Result<Vec<ConversationSummaryResponse>, ApiFailure> {
    let rows = memberships(state, user_id).await?;

    let other_users: Vec<UserId> = rows
        .iter()
        .filter_map(|(conversation, _)| match &conversation.scope {
            ConversationScope::Direct { dm_key } => dm_key.other_participant(user_id),
            ConversationScope::Channel { .. } => None,
        })
        .collect();
    let channel_ids: Vec<String> = rows
        .iter()
        .filter_map(|(conversation, _)| match &conversation.scope {
            ConversationScope::Channel { channel_id, .. } => channel_id.clone(),
            ConversationScope::Direct { .. } => None,
        })
        .collect();
    let users = user_summaries(state, other_users).await?;
    let channels = channel_labels(state, channel_ids).await?;

    let mut summaries = Vec::with_capacity(rows.len());
    for (conversation, last_read_at_ms) in rows {
        let unread = is_unread(conversation.last_message_at_ms, last_read_at_ms);
        let kind = conversation.scope.kind().as_str();
        let summary = match conversation.scope {
            ConversationScope::Direct { dm_key } => {
                let Some(other) = dm_key
                    .other_participant(user_id)
                    .and_then(|other| users.get(&other))
                else {
                    continue;
                };
                ConversationSummaryResponse {
                    conversation_id: conversation.conversation_id,
                    kind,
                    title: other.display_name.clone(),
                    avatar_url: other.avatar_url.clone(),
                    other_user_id: Some(other.id.clone()),
                    server_id: None,
                    channel_id: None,
                    last_message_id: conversation.last_message_id,
                    last_message_at: conversation.last_message_at_ms,
                    unread,
                }
            }
            ConversationScope::Channel {
                server_id,
                channel_id,
            } => {
                let Some((channel_id, label)) = channel_id
                    .and_then(|channel_id| channels.get(&channel_id).map(|label| (channel_id, label)))
                else {
                    continue;
                };
                let title = ChannelName::try_from(label.name.clone())
                    .map_or_else(|_| format!("#{}", label.name), |name| name.conversation_title());
                ConversationSummaryResponse {
                    conversation_id: conversation.conversation_id,
                    kind,
                    title,
                    avatar_url: label
                        .icon_key
                        .as_deref()
                        .map(|key| state.storage.public_url(key)),
                    other_user_id: None,
                    server_id: Some(server_id),
                    channel_id: Some(channel_id),
                    last_message_id: conversation.last_message_id,
                    last_message_at: conversation.last_message_at_ms,
                    unread,
                }
            }
        };
        summaries.push(summary);
    }
    Ok(summaries)
}
