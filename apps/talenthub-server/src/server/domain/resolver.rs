use sqlx::{PgPool, Row};
use talenthub_core::{ConversationKind, ConversationScope, DmKey, UserId};
use ulid::Ulid;

use super::workspace::server_member;
use crate::server::{
    auth::now_unix_ms,
    core::{
        AppState, ChannelRecord, ConversationMemberRecord, ConversationRecord, MessengerStore,
    },
    db::{is_unique_violation, ready_pool},
    errors::ApiFailure,
    user_repository::{UserPersistence, UserRepository},
};

#[derive(Debug, Clone)]
pub(crate) struct ResolvedChannel {
    pub(crate) conversation_id: String,
    pub(crate) server_id: String,
    pub(crate) channel_id: String,
    pub(crate) channel_key: String,
    pub(crate) channel_name: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedDm {
    pub(crate) conversation_id: String,
    pub(crate) dm_key: DmKey,
    pub(crate) created: bool,
}

async fn find_channel_conversation(
    pool: &PgPool,
    channel_id: &str,
) -> Result<Option<String>, ApiFailure> {
    let row = sqlx::query("SELECT conversation_id FROM conversations WHERE channel_id = $1")
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| row.try_get("conversation_id")).transpose()?)
}

/// Links the oldest unlinked channel conversation of the server to `channel_id`.
///
/// Match and set happen in one statement; a concurrent winner surfaces as a
/// unique violation on `channel_id`.
async fn adopt_orphan(
    pool: &PgPool,
    server_id: &str,
    channel_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query(
        "UPDATE conversations SET channel_id = $2
         WHERE conversation_id = (
             SELECT conversation_id FROM conversations
             WHERE kind = $3 AND server_id = $1 AND channel_id IS NULL
             ORDER BY created_at_ms ASC, conversation_id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED
         )
         AND channel_id IS NULL
         RETURNING conversation_id",
    )
    .bind(server_id)
    .bind(channel_id)
    .bind(ConversationKind::Channel.as_i16())
    .fetch_optional(pool)
    .await?;
    row.map(|row| row.try_get("conversation_id")).transpose()
}

async fn resolve_channel_conversation_db(
    pool: &PgPool,
    server_id: &str,
    channel_id: &str,
) -> Result<String, ApiFailure> {
    if let Some(conversation_id) = find_channel_conversation(pool, channel_id).await? {
        return Ok(conversation_id);
    }

    match adopt_orphan(pool, server_id, channel_id).await {
        Ok(Some(conversation_id)) => {
            tracing::info!(
                event = "conversations.resolve",
                outcome = "adopted",
                conversation_id = %conversation_id,
                channel_id = %channel_id,
            );
            return Ok(conversation_id);
        }
        Ok(None) => {}
        Err(error) if is_unique_violation(&error) => {
            return find_channel_conversation(pool, channel_id)
                .await?
                .ok_or(ApiFailure::Internal);
        }
        Err(error) => return Err(error.into()),
    }

    let created = sqlx::query(
        "INSERT INTO conversations (conversation_id, kind, server_id, channel_id, created_at_ms)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (channel_id) WHERE channel_id IS NOT NULL DO NOTHING
         RETURNING conversation_id",
    )
    .bind(Ulid::new().to_string())
    .bind(ConversationKind::Channel.as_i16())
    .bind(server_id)
    .bind(channel_id)
    .bind(now_unix_ms())
    .fetch_optional(pool)
    .await?;
    if let Some(row) = created {
        return Ok(row.try_get("conversation_id")?);
    }
    find_channel_conversation(pool, channel_id)
        .await?
        .ok_or(ApiFailure::Internal)
}

fn resolve_channel_conversation_in_memory(
    messenger: &mut MessengerStore,
    server_id: &str,
    channel_id: &str,
) -> String {
    if let Some(conversation_id) = messenger.channel_index.get(channel_id) {
        return conversation_id.clone();
    }

    let orphan = messenger
        .conversations
        .values_mut()
        .filter(|conversation| {
            matches!(
                &conversation.scope,
                ConversationScope::Channel { server_id: owner, channel_id: None } if owner == server_id
            )
        })
        .min_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
    let conversation_id = if let Some(orphan) = orphan {
        orphan.scope = ConversationScope::Channel {
            server_id: server_id.to_owned(),
            channel_id: Some(channel_id.to_owned()),
        };
        orphan.conversation_id.clone()
    } else {
        let conversation = ConversationRecord {
            conversation_id: Ulid::new().to_string(),
            scope: ConversationScope::Channel {
                server_id: server_id.to_owned(),
                channel_id: Some(channel_id.to_owned()),
            },
            last_message_id: None,
            last_message_at_ms: None,
            created_at_ms: now_unix_ms(),
        };
        let conversation_id = conversation.conversation_id.clone();
        messenger
            .conversations
            .insert(conversation_id.clone(), conversation);
        conversation_id
    };
    messenger
        .channel_index
        .insert(channel_id.to_owned(), conversation_id.clone());
    conversation_id
}

/// Returns the conversation of `channel`, adopting or creating it when missing,
/// and records the caller as a conversation member.
pub(crate) async fn resolve_channel_conversation(
    state: &AppState,
    caller: UserId,
    channel: &ChannelRecord,
) -> Result<ResolvedChannel, ApiFailure> {
    if server_member(state, &channel.server_id, caller)
        .await?
        .is_none()
    {
        return Err(ApiFailure::Forbidden("You are not a member of this server"));
    }
    let channel_key = channel.channel_key.clone().ok_or(ApiFailure::Internal)?;
    let joined_at_ms = now_unix_ms();

    let conversation_id = if let Some(pool) = ready_pool(state).await? {
        let conversation_id =
            resolve_channel_conversation_db(pool, &channel.server_id, &channel.channel_id)
                .await?;
        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, joined_at_ms)
             VALUES ($1, $2, $3)
             ON CONFLICT (conversation_id, user_id) DO NOTHING",
        )
        .bind(&conversation_id)
        .bind(caller.to_string())
        .bind(joined_at_ms)
        .execute(pool)
        .await?;
        conversation_id
    } else {
        let mut messenger = state.messenger.write().await;
        let conversation_id = resolve_channel_conversation_in_memory(
            &mut messenger,
            &channel.server_id,
            &channel.channel_id,
        );
        messenger
            .members
            .entry(conversation_id.clone())
            .or_default()
            .entry(caller)
            .or_insert_with(|| ConversationMemberRecord {
                joined_at_ms,
                ..ConversationMemberRecord::default()
            });
        conversation_id
    };

    Ok(ResolvedChannel {
        conversation_id,
        server_id: channel.server_id.clone(),
        channel_id: channel.channel_id.clone(),
        channel_key,
        channel_name: channel.name.clone(),
    })
}

/// Finds or creates the direct conversation between `caller` and `other`.
///
/// Both members are written together with a new conversation; an existing one
/// is returned untouched.
pub(crate) async fn resolve_or_create_dm(
    state: &AppState,
    caller: UserId,
    other: UserId,
) -> Result<ResolvedDm, ApiFailure> {
    let dm_key = DmKey::from_pair(caller, other)
        .map_err(|_| ApiFailure::InvalidRequest("Cannot start a conversation with yourself"))?;
    if UserRepository::from_state(state)
        .find_by_id(other)
        .await?
        .is_none()
    {
        return Err(ApiFailure::NotFound("User not found"));
    }
    let created_at_ms = now_unix_ms();
    let candidate_id = Ulid::new().to_string();

    if let Some(pool) = ready_pool(state).await? {
        let mut tx = pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO conversations (conversation_id, kind, dm_key, created_at_ms)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (dm_key) WHERE dm_key IS NOT NULL DO NOTHING
             RETURNING conversation_id",
        )
        .bind(&candidate_id)
        .bind(ConversationKind::Direct.as_i16())
        .bind(dm_key.as_str())
        .bind(created_at_ms)
        .fetch_optional(&mut *tx)
        .await?;
        if inserted.is_some() {
            let (low, high) = dm_key.participants();
            for participant in [low, high] {
                sqlx::query(
                    "INSERT INTO conversation_members (conversation_id, user_id, joined_at_ms)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (conversation_id, user_id) DO NOTHING",
                )
                .bind(&candidate_id)
                .bind(participant.to_string())
                .bind(created_at_ms)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            tracing::info!(event = "dms.create", conversation_id = %candidate_id);
            return Ok(ResolvedDm {
                conversation_id: candidate_id,
                dm_key,
                created: true,
            });
        }
        tx.rollback().await?;

        let row = sqlx::query("SELECT conversation_id FROM conversations WHERE dm_key = $1")
            .bind(dm_key.as_str())
            .fetch_optional(pool)
            .await?
            .ok_or(ApiFailure::Internal)?;
        return Ok(ResolvedDm {
            conversation_id: row.try_get("conversation_id")?,
            dm_key,
            created: false,
        });
    }

    let mut messenger = state.messenger.write().await;
    if let Some(conversation_id) = messenger.dm_index.get(dm_key.as_str()) {
        return Ok(ResolvedDm {
            conversation_id: conversation_id.clone(),
            dm_key,
            created: false,
        });
    }
    messenger.conversations.insert(
        candidate_id.clone(),
        ConversationRecord {
            conversation_id: candidate_id.clone(),
            scope: ConversationScope::Direct {
                dm_key: dm_key.clone(),
            },
            last_message_id: None,
            last_message_at_ms: None,
            created_at_ms,
        },
    );
    messenger
        .dm_index
        .insert(dm_key.as_str().to_owned(), candidate_id.clone());
    let members = messenger.members.entry(candidate_id.clone()).or_default();
    let (low, high) = dm_key.participants();
    for participant in [low, high] {
        members.insert(
            participant,
            ConversationMemberRecord {
                joined_at_ms: created_at_ms,
                ..ConversationMemberRecord::default()
            },
        );
    }
    tracing::info!(event = "dms.create", conversation_id = %candidate_id);
    Ok(ResolvedDm {
        conversation_id: candidate_id,
        dm_key,
        created: true,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use futures_util::future::join_all;
    use talenthub_core::{ConversationScope, ServerName, UserId};

    use super::{resolve_channel_conversation, resolve_channel_conversation_in_memory};
    use crate::server::{
        core::{AppConfig, AppState, ChannelRecord, ConversationRecord, MessengerStore},
        domain::{create_server, join_server},
    };

    fn orphan(conversation_id: &str, server_id: &str, created_at_ms: i64) -> ConversationRecord {
        ConversationRecord {
            conversation_id: conversation_id.to_owned(),
            scope: ConversationScope::Channel {
                server_id: server_id.to_owned(),
                channel_id: None,
            },
            last_message_id: None,
            last_message_at_ms: None,
            created_at_ms,
        }
    }

    #[test]
    fn oldest_orphan_of_the_server_is_adopted_once() {
        let mut messenger = MessengerStore::default();
        for record in [orphan("c2", "s1", 20), orphan("c1", "s1", 10), orphan("c0", "s2", 1)] {
            messenger
                .conversations
                .insert(record.conversation_id.clone(), record);
        }

        let first = resolve_channel_conversation_in_memory(&mut messenger, "s1", "ch-a");
        let again = resolve_channel_conversation_in_memory(&mut messenger, "s1", "ch-a");
        let second = resolve_channel_conversation_in_memory(&mut messenger, "s1", "ch-b");
        let third = resolve_channel_conversation_in_memory(&mut messenger, "s1", "ch-c");

        assert_eq!(first, "c1");
        assert_eq!(again, "c1");
        assert_eq!(second, "c2");
        assert!(!["c0", "c1", "c2"].contains(&third.as_str()));
        assert!(matches!(
            &messenger.conversations["c0"].scope,
            ConversationScope::Channel { channel_id: None, .. }
        ));
    }

    /// Server with two members whose `general` channel has lost its conversation.
    async fn server_with_unlinked_general(
        orphan_id: Option<&str>,
    ) -> (AppState, [UserId; 2], ChannelRecord) {
        let state = AppState::new(&AppConfig {
            storage_root: std::env::temp_dir()
                .join(format!("talenthub-resolver-{}", ulid::Ulid::new())),
            ..AppConfig::default()
        })
        .expect("state should initialize");
        let (owner, guest) = (UserId::new(), UserId::new());
        let name = ServerName::try_from(String::from("Relinked")).expect("valid name");
        let (server, channels) = create_server(&state, owner, &name, false)
            .await
            .expect("server should be created");
        join_server(&state, &server.server_id, guest)
            .await
            .expect("guest should join");
        let general = channels
            .into_iter()
            .find(|channel| channel.name == "general")
            .expect("default channel");
        {
            let mut messenger = state.messenger.write().await;
            let linked = messenger
                .channel_index
                .remove(&general.channel_id)
                .expect("general starts linked");
            messenger.conversations.remove(&linked);
            if let Some(orphan_id) = orphan_id {
                messenger.conversations.insert(
                    orphan_id.to_owned(),
                    orphan(orphan_id, &server.server_id, 1),
                );
            }
        }
        (state, [owner, guest], general)
    }

    async fn resolve_concurrently(
        state: &AppState,
        callers: [UserId; 2],
        channel: &ChannelRecord,
    ) -> HashSet<String> {
        let attempts = (0..8).map(|attempt| {
            resolve_channel_conversation(state, callers[attempt % 2], channel)
        });
        join_all(attempts)
            .await
            .into_iter()
            .map(|resolved| resolved.expect("members can resolve").conversation_id)
            .collect()
    }

    fn linked_to(messenger: &MessengerStore, channel_id: &str) -> usize {
        messenger
            .conversations
            .values()
            .filter(|conversation| {
                matches!(
                    &conversation.scope,
                    ConversationScope::Channel { channel_id: Some(linked), .. } if linked == channel_id
                )
            })
            .count()
    }

    #[tokio::test]
    async fn concurrent_resolution_adopts_the_orphan_once() {
        let (state, callers, general) = server_with_unlinked_general(Some("orphan-1")).await;

        let resolved = resolve_concurrently(&state, callers, &general).await;

        assert_eq!(resolved, HashSet::from([String::from("orphan-1")]));
        let messenger = state.messenger.read().await;
        assert_eq!(linked_to(&messenger, &general.channel_id), 1);
        assert_eq!(messenger.members["orphan-1"].len(), 2);
    }

    #[tokio::test]
    async fn concurrent_resolution_recreates_a_missing_conversation_once() {
        let (state, callers, general) = server_with_unlinked_general(None).await;

        let resolved = resolve_concurrently(&state, callers, &general).await;

        assert_eq!(resolved.len(), 1);
        let messenger = state.messenger.read().await;
        assert_eq!(linked_to(&messenger, &general.channel_id), 1);
    }
}
