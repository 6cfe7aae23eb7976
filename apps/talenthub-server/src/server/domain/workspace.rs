use std::collections::HashSet;

use sqlx::{PgPool, Postgres, Row, Transaction};
use talenthub_core::{
    ChannelKind, ChannelName, ConversationKind, ConversationScope, ServerName, ServerRole, UserId,
    DEFAULT_CHANNEL_NAMES,
};
use ulid::Ulid;

use super::{channel_from_row, server_from_row, CHANNEL_COLUMNS, SERVER_COLUMNS};
use crate::server::{
    auth::{now_unix_ms, random_token},
    core::{
        AppState, ChannelRecord, ConversationRecord, MessengerStore, ServerMemberRecord,
        ServerRecord,
    },
    db::ready_pool,
    errors::ApiFailure,
};

/// Membership row together with the member's id.
#[derive(Debug, Clone)]
pub(crate) struct ServerMemberRow {
    pub(crate) user_id: UserId,
    pub(crate) member: ServerMemberRecord,
}

pub(crate) async fn load_server(
    state: &AppState,
    server_id: &str,
) -> Result<Option<ServerRecord>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE server_id = $1"
        ))
        .bind(server_id)
        .fetch_optional(pool)
        .await?;
        return row.as_ref().map(server_from_row).transpose();
    }

    Ok(state.workspace.read().await.servers.get(server_id).cloned())
}

pub(crate) async fn server_member(
    state: &AppState,
    server_id: &str,
    user_id: UserId,
) -> Result<Option<ServerMemberRecord>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(
            "SELECT roles, muted, joined_at_ms FROM server_members
             WHERE server_id = $1 AND user_id = $2",
        )
        .bind(server_id)
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await?;
        return row
            .map(|row| {
                Ok(ServerMemberRecord {
                    roles: row.try_get("roles")?,
                    muted: row.try_get("muted")?,
                    joined_at_ms: row.try_get("joined_at_ms")?,
                })
            })
            .transpose();
    }

    Ok(state
        .workspace
        .read()
        .await
        .members
        .get(server_id)
        .and_then(|members| members.get(&user_id))
        .cloned())
}

/// Members of a server, oldest first.
pub(crate) async fn server_members(
    state: &AppState,
    server_id: &str,
) -> Result<Vec<ServerMemberRow>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(
            "SELECT user_id, roles, muted, joined_at_ms FROM server_members
             WHERE server_id = $1
             ORDER BY joined_at_ms ASC, user_id ASC",
        )
        .bind(server_id)
        .fetch_all(pool)
        .await?;
        return rows
            .iter()
            .map(|row| {
                let user_id: String = row.try_get("user_id")?;
                Ok(ServerMemberRow {
                    user_id: UserId::try_from(user_id).map_err(|_| ApiFailure::Internal)?,
                    member: ServerMemberRecord {
                        roles: row.try_get("roles")?,
                        muted: row.try_get("muted")?,
                        joined_at_ms: row.try_get("joined_at_ms")?,
                    },
                })
            })
            .collect();
    }

    let workspace = state.workspace.read().await;
    let mut rows: Vec<ServerMemberRow> = workspace
        .members
        .get(server_id)
        .map(|members| {
            members
                .iter()
                .map(|(user_id, member)| ServerMemberRow {
                    user_id: *user_id,
                    member: member.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    rows.sort_by(|a, b| {
        a.member
            .joined_at_ms
            .cmp(&b.member.joined_at_ms)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    Ok(rows)
}

/// Loads a server the caller owns.
pub(crate) async fn require_owner(
    state: &AppState,
    server_id: &str,
    user_id: UserId,
) -> Result<ServerRecord, ApiFailure> {
    let server = load_server(state, server_id)
        .await?
        .ok_or(ApiFailure::NotFound("Server not found"))?;
    if server.owner_id != user_id {
        return Err(ApiFailure::Forbidden("Only the server owner can do that"));
    }
    Ok(server)
}

fn new_channel(server_id: &str, name: &str, created_at_ms: i64) -> ChannelRecord {
    ChannelRecord {
        channel_id: Ulid::new().to_string(),
        server_id: server_id.to_owned(),
        name: name.to_owned(),
        channel_key: Some(random_token()),
        created_at_ms,
    }
}

fn channel_conversation(channel: &ChannelRecord) -> ConversationRecord {
    ConversationRecord {
        conversation_id: Ulid::new().to_string(),
        scope: ConversationScope::Channel {
            server_id: channel.server_id.clone(),
            channel_id: Some(channel.channel_id.clone()),
        },
        last_message_id: None,
        last_message_at_ms: None,
        created_at_ms: channel.created_at_ms,
    }
}

async fn insert_channel_with_conversation(
    tx: &mut Transaction<'_, Postgres>,
    channel: &ChannelRecord,
) -> Result<(), ApiFailure> {
    sqlx::query(
        "INSERT INTO channels (channel_id, server_id, name, kind, channel_key, created_at_ms)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&channel.channel_id)
    .bind(&channel.server_id)
    .bind(&channel.name)
    .bind(ChannelKind::Text.as_str())
    .bind(&channel.channel_key)
    .bind(channel.created_at_ms)
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "INSERT INTO conversations (conversation_id, kind, server_id, channel_id, created_at_ms)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Ulid::new().to_string())
    .bind(ConversationKind::Channel.as_i16())
    .bind(&channel.server_id)
    .bind(&channel.channel_id)
    .bind(channel.created_at_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn index_channel_conversation(messenger: &mut MessengerStore, channel: &ChannelRecord) {
    let conversation = channel_conversation(channel);
    messenger
        .channel_index
        .insert(channel.channel_id.clone(), conversation.conversation_id.clone());
    messenger
        .conversations
        .insert(conversation.conversation_id.clone(), conversation);
}

/// Creates a server owned by `owner` with its default channels, each already linked to a conversation.
pub(crate) async fn create_server(
    state: &AppState,
    owner: UserId,
    name: &ServerName,
    is_public: bool,
) -> Result<(ServerRecord, Vec<ChannelRecord>), ApiFailure> {
    let created_at_ms = now_unix_ms();
    let server = ServerRecord {
        server_id: Ulid::new().to_string(),
        name: name.as_str().to_owned(),
        icon_key: None,
        owner_id: owner,
        is_public,
        invite_key: random_token(),
        created_at_ms,
    };
    let channels: Vec<ChannelRecord> = DEFAULT_CHANNEL_NAMES
        .iter()
        .map(|channel_name| new_channel(&server.server_id, channel_name, created_at_ms))
        .collect();
    let owner_member = ServerMemberRecord {
        roles: vec![ServerRole::Owner.as_str().to_owned()],
        muted: false,
        joined_at_ms: created_at_ms,
    };

    if let Some(pool) = ready_pool(state).await? {
        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO servers (server_id, name, owner_user_id, is_public, invite_key, created_at_ms)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&server.server_id)
        .bind(&server.name)
        .bind(owner.to_string())
        .bind(server.is_public)
        .bind(&server.invite_key)
        .bind(created_at_ms)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO server_members (server_id, user_id, roles, muted, joined_at_ms)
             VALUES ($1, $2, $3, FALSE, $4)",
        )
        .bind(&server.server_id)
        .bind(owner.to_string())
        .bind(&owner_member.roles)
        .bind(created_at_ms)
        .execute(&mut *tx)
        .await?;
        for channel in &channels {
            insert_channel_with_conversation(&mut tx, channel).await?;
        }
        tx.commit().await?;
    } else {
        let mut workspace = state.workspace.write().await;
        let mut messenger = state.messenger.write().await;
        workspace
            .servers
            .insert(server.server_id.clone(), server.clone());
        workspace
            .members
            .entry(server.server_id.clone())
            .or_default()
            .insert(owner, owner_member);
        for channel in &channels {
            workspace
                .channels
                .insert(channel.channel_id.clone(), channel.clone());
            index_channel_conversation(&mut messenger, channel);
        }
    }

    tracing::info!(event = "servers.create", server_id = %server.server_id, owner_id = %owner);
    Ok((server, channels))
}

pub(crate) async fn create_channel(
    state: &AppState,
    server_id: &str,
    name: &ChannelName,
) -> Result<ChannelRecord, ApiFailure> {
    let channel = new_channel(server_id, name.as_str(), now_unix_ms());
    if let Some(pool) = ready_pool(state).await? {
        let mut tx = pool.begin().await?;
        insert_channel_with_conversation(&mut tx, &channel).await?;
        tx.commit().await?;
    } else {
        let mut workspace = state.workspace.write().await;
        if !workspace.servers.contains_key(server_id) {
            return Err(ApiFailure::NotFound("Server not found"));
        }
        let mut messenger = state.messenger.write().await;
        workspace
            .channels
            .insert(channel.channel_id.clone(), channel.clone());
        index_channel_conversation(&mut messenger, &channel);
    }
    Ok(channel)
}

/// Gives a legacy channel its key. Concurrent callers converge on the first key written.
async fn ensure_channel_key(
    state: &AppState,
    channel: ChannelRecord,
) -> Result<ChannelRecord, ApiFailure> {
    if channel.channel_key.is_some() {
        return Ok(channel);
    }
    let candidate = random_token();
    if let Some(pool) = ready_pool(state).await? {
        sqlx::query(
            "UPDATE channels SET channel_key = $1 WHERE channel_id = $2 AND channel_key IS NULL",
        )
        .bind(&candidate)
        .bind(&channel.channel_id)
        .execute(pool)
        .await?;
        return fetch_channel(pool, "channel_id", &channel.channel_id)
            .await?
            .ok_or(ApiFailure::NotFound("Channel not found"));
    }

    let mut workspace = state.workspace.write().await;
    let stored = workspace
        .channels
        .get_mut(&channel.channel_id)
        .ok_or(ApiFailure::NotFound("Channel not found"))?;
    if stored.channel_key.is_none() {
        stored.channel_key = Some(candidate);
    }
    Ok(stored.clone())
}

async fn fetch_channel(
    pool: &PgPool,
    column: &'static str,
    value: &str,
) -> Result<Option<ChannelRecord>, ApiFailure> {
    let row = sqlx::query(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels WHERE {column} = $1"
    ))
    .bind(value)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(channel_from_row).transpose()
}

pub(crate) async fn channel_by_key(
    state: &AppState,
    channel_key: &str,
) -> Result<Option<ChannelRecord>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        return fetch_channel(pool, "channel_key", channel_key).await;
    }
    Ok(state
        .workspace
        .read()
        .await
        .channels
        .values()
        .find(|channel| channel.channel_key.as_deref() == Some(channel_key))
        .cloned())
}

/// Channel `channel_id` when it belongs to `server_id`, with its key backfilled.
pub(crate) async fn channel_in_server(
    state: &AppState,
    server_id: &str,
    channel_id: &str,
) -> Result<Option<ChannelRecord>, ApiFailure> {
    let channel = if let Some(pool) = ready_pool(state).await? {
        fetch_channel(pool, "channel_id", channel_id).await?
    } else {
        state.workspace.read().await.channels.get(channel_id).cloned()
    };
    match channel.filter(|channel| channel.server_id == server_id) {
        Some(channel) => ensure_channel_key(state, channel).await.map(Some),
        None => Ok(None),
    }
}

/// Channels of a server in creation order, with missing keys backfilled.
pub(crate) async fn list_channels(
    state: &AppState,
    server_id: &str,
) -> Result<Vec<ChannelRecord>, ApiFailure> {
    let channels = if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels
             WHERE server_id = $1
             ORDER BY created_at_ms ASC, channel_id ASC"
        ))
        .bind(server_id)
        .fetch_all(pool)
        .await?;
        rows.iter()
            .map(channel_from_row)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let workspace = state.workspace.read().await;
        let mut channels: Vec<ChannelRecord> = workspace
            .channels
            .values()
            .filter(|channel| channel.server_id == server_id)
            .cloned()
            .collect();
        channels.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        channels
    };

    let mut keyed = Vec::with_capacity(channels.len());
    for channel in channels {
        keyed.push(ensure_channel_key(state, channel).await?);
    }
    Ok(keyed)
}

/// Deletes a server with its channels, conversations, memberships and messages.
///
/// Returns the icon key so the caller can drop the stored file.
pub(crate) async fn delete_server(
    state: &AppState,
    server_id: &str,
) -> Result<Option<String>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM conversations WHERE server_id = $1")
            .bind(server_id)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query("DELETE FROM servers WHERE server_id = $1 RETURNING icon_key")
            .bind(server_id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        let Some(row) = row else {
            return Err(ApiFailure::NotFound("Server not found"));
        };
        return Ok(row.try_get("icon_key")?);
    }

    let mut workspace = state.workspace.write().await;
    let server = workspace
        .servers
        .remove(server_id)
        .ok_or(ApiFailure::NotFound("Server not found"))?;
    workspace.members.remove(server_id);
    workspace.bans.remove(server_id);
    workspace
        .channels
        .retain(|_, channel| channel.server_id != server_id);

    let mut messenger = state.messenger.write().await;
    let removed: Vec<String> = messenger
        .conversations
        .values()
        .filter(|conversation| {
            matches!(&conversation.scope, ConversationScope::Channel { server_id: owner, .. } if owner == server_id)
        })
        .map(|conversation| conversation.conversation_id.clone())
        .collect();
    remove_conversations(&mut messenger, &removed);
    Ok(server.icon_key)
}

fn remove_conversations(messenger: &mut MessengerStore, conversation_ids: &[String]) {
    for conversation_id in conversation_ids {
        messenger.conversations.remove(conversation_id);
        messenger.members.remove(conversation_id);
        if let Some(timeline) = messenger.timeline.remove(conversation_id) {
            for message_id in timeline {
                messenger.messages.remove(&message_id);
            }
        }
    }
    let removed: HashSet<&String> = conversation_ids.iter().collect();
    messenger
        .channel_index
        .retain(|_, conversation_id| !removed.contains(conversation_id));
}

#[cfg(test)]
mod tests {
    use talenthub_core::{ChannelName, ServerName, UserId};

    use super::{
        channel_by_key, channel_in_server, create_channel, create_server, delete_server,
        list_channels, require_owner, server_member,
    };
    use crate::server::{
        core::{AppConfig, AppState},
        errors::ApiFailure,
    };

    fn state() -> AppState {
        AppState::new(&AppConfig {
            storage_root: std::env::temp_dir()
                .join(format!("talenthub-workspace-{}", ulid::Ulid::new())),
            ..AppConfig::default()
        })
        .expect("state should initialize")
    }

    #[tokio::test]
    async fn new_servers_get_default_channels_with_conversations() {
        let state = state();
        let owner = UserId::new();
        let name = ServerName::try_from(String::from("Guild")).expect("valid name");
        let (server, channels) = create_server(&state, owner, &name, false)
            .await
            .expect("server should be created");

        let names: Vec<&str> = channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["general", "random"]);
        let messenger = state.messenger.read().await;
        for channel in &channels {
            assert!(messenger.channel_index.contains_key(&channel.channel_id));
        }
        drop(messenger);

        let member = server_member(&state, &server.server_id, owner)
            .await
            .expect("lookup should succeed")
            .expect("owner should be a member");
        assert_eq!(member.roles, ["owner"]);
        assert_eq!(
            require_owner(&state, &server.server_id, UserId::new())
                .await
                .expect_err("stranger is not owner"),
            ApiFailure::Forbidden("Only the server owner can do that")
        );
    }

    #[tokio::test]
    async fn legacy_channels_are_backfilled_with_one_key() {
        let state = state();
        let owner = UserId::new();
        let name = ServerName::try_from(String::from("Legacy")).expect("valid name");
        let (server, _) = create_server(&state, owner, &name, true)
            .await
            .expect("server should be created");
        let channel = create_channel(
            &state,
            &server.server_id,
            &ChannelName::try_from(String::from("Design")).expect("valid channel name"),
        )
        .await
        .expect("channel should be created");
        state
            .workspace
            .write()
            .await
            .channels
            .get_mut(&channel.channel_id)
            .expect("channel exists")
            .channel_key = None;

        let first = channel_in_server(&state, &server.server_id, &channel.channel_id)
            .await
            .expect("lookup should succeed")
            .expect("channel should exist");
        let listed = list_channels(&state, &server.server_id)
            .await
            .expect("list should succeed");
        let key = first.channel_key.clone().expect("key should be backfilled");
        assert!(listed
            .iter()
            .any(|c| c.channel_id == channel.channel_id && c.channel_key.as_deref() == Some(&key)));
        assert!(channel_by_key(&state, &key)
            .await
            .expect("lookup should succeed")
            .is_some());
        assert!(channel_in_server(&state, "other", &channel.channel_id)
            .await
            .expect("lookup should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn deleting_a_server_drops_its_conversations() {
        let state = state();
        let name = ServerName::try_from(String::from("Gone")).expect("valid name");
        let (server, _) = create_server(&state, UserId::new(), &name, false)
            .await
            .expect("server should be created");
        delete_server(&state, &server.server_id)
            .await
            .expect("delete should succeed");
        assert!(state.messenger.read().await.conversations.is_empty());
        assert!(state.workspace.read().await.channels.is_empty());
        assert_eq!(
            delete_server(&state, &server.server_id)
                .await
                .expect_err("second delete should fail"),
            ApiFailure::NotFound("Server not found")
        );
    }
}
