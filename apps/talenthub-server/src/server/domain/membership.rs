use sqlx::Row;
use talenthub_core::{ServerName, ServerRole, UserId};

use super::{server_from_row, workspace::load_server, SERVER_COLUMNS};
use crate::server::{
    auth::{now_unix_ms, random_token},
    core::{AppState, ServerBanRecord, ServerMemberRecord, ServerRecord, MAX_DISCOVERED_SERVERS},
    db::ready_pool,
    errors::ApiFailure,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinOutcome {
    Joined,
    AlreadyMember,
}

/// Field changes an owner may apply to a server.
#[derive(Debug, Default)]
pub(crate) struct ServerChanges<'a> {
    pub(crate) name: Option<&'a ServerName>,
    pub(crate) is_public: Option<bool>,
}

/// Servers the user belongs to, in the order they joined.
pub(crate) async fn servers_for_user(
    state: &AppState,
    user_id: UserId,
) -> Result<Vec<ServerRecord>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM servers s
             JOIN server_members m ON m.server_id = s.server_id
             WHERE m.user_id = $1
             ORDER BY m.joined_at_ms ASC, s.server_id ASC",
            qualified_server_columns()
        ))
        .bind(user_id.to_string())
        .fetch_all(pool)
        .await?;
        return rows.iter().map(server_from_row).collect();
    }

    let workspace = state.workspace.read().await;
    let mut joined: Vec<(i64, ServerRecord)> = workspace
        .members
        .iter()
        .filter_map(|(server_id, members)| {
            let member = members.get(&user_id)?;
            let server = workspace.servers.get(server_id)?;
            Some((member.joined_at_ms, server.clone()))
        })
        .collect();
    joined.sort_by(|(a_at, a), (b_at, b)| a_at.cmp(b_at).then_with(|| a.server_id.cmp(&b.server_id)));
    Ok(joined.into_iter().map(|(_, server)| server).collect())
}

fn qualified_server_columns() -> String {
    SERVER_COLUMNS
        .split(',')
        .map(|column| format!("s.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) async fn member_count(state: &AppState, server_id: &str) -> Result<u64, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM server_members WHERE server_id = $1")
                .bind(server_id)
                .fetch_one(pool)
                .await?;
        return u64::try_from(count).map_err(|_| ApiFailure::Internal);
    }
    let count = state
        .workspace
        .read()
        .await
        .members
        .get(server_id)
        .map_or(0, std::collections::HashMap::len);
    u64::try_from(count).map_err(|_| ApiFailure::Internal)
}

/// Public servers whose name contains `query`, newest first.
pub(crate) async fn discover_servers(
    state: &AppState,
    query: Option<&str>,
) -> Result<Vec<ServerRecord>, ApiFailure> {
    let needle = query
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .map(str::to_lowercase);
    if let Some(pool) = ready_pool(state).await? {
        let pattern = needle.map(|needle| {
            let escaped = needle
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            format!("%{escaped}%")
        });
        let rows = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers
             WHERE is_public = TRUE AND ($1::TEXT IS NULL OR LOWER(name) LIKE $1)
             ORDER BY created_at_ms DESC
             LIMIT $2"
        ))
        .bind(pattern)
        .bind(i64::try_from(MAX_DISCOVERED_SERVERS).map_err(|_| ApiFailure::Internal)?)
        .fetch_all(pool)
        .await?;
        return rows.iter().map(server_from_row).collect();
    }

    let workspace = state.workspace.read().await;
    let mut servers: Vec<ServerRecord> = workspace
        .servers
        .values()
        .filter(|server| server.is_public)
        .filter(|server| {
            needle
                .as_deref()
                .is_none_or(|needle| server.name.to_lowercase().contains(needle))
        })
        .cloned()
        .collect();
    servers.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
    servers.truncate(MAX_DISCOVERED_SERVERS);
    Ok(servers)
}

pub(crate) async fn server_by_invite(
    state: &AppState,
    invite_key: &str,
) -> Result<Option<ServerRecord>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE invite_key = $1"
        ))
        .bind(invite_key)
        .fetch_optional(pool)
        .await?;
        return row.as_ref().map(server_from_row).transpose();
    }
    Ok(state
        .workspace
        .read()
        .await
        .servers
        .values()
        .find(|server| server.invite_key == invite_key)
        .cloned())
}

/// Adds the user as a plain member unless banned. Joining twice is not an error.
pub(crate) async fn join_server(
    state: &AppState,
    server_id: &str,
    user_id: UserId,
) -> Result<JoinOutcome, ApiFailure> {
    let member = ServerMemberRecord {
        roles: vec![ServerRole::Member.as_str().to_owned()],
        muted: false,
        joined_at_ms: now_unix_ms(),
    };
    if let Some(pool) = ready_pool(state).await? {
        let mut tx = pool.begin().await?;
        let banned = sqlx::query(
            "SELECT 1 FROM server_bans WHERE server_id = $1 AND banned_user_id = $2",
        )
        .bind(server_id)
        .bind(user_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .is_some();
        if banned {
            return Err(ApiFailure::Forbidden("You are banned from this server"));
        }
        let inserted = sqlx::query(
            "INSERT INTO server_members (server_id, user_id, roles, muted, joined_at_ms)
             VALUES ($1, $2, $3, FALSE, $4)
             ON CONFLICT (server_id, user_id) DO NOTHING",
        )
        .bind(server_id)
        .bind(user_id.to_string())
        .bind(&member.roles)
        .bind(member.joined_at_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        return Ok(if inserted > 0 {
            JoinOutcome::Joined
        } else {
            JoinOutcome::AlreadyMember
        });
    }

    let mut workspace = state.workspace.write().await;
    if !workspace.servers.contains_key(server_id) {
        return Err(ApiFailure::NotFound("Server not found"));
    }
    if workspace
        .bans
        .get(server_id)
        .is_some_and(|bans| bans.contains_key(&user_id))
    {
        return Err(ApiFailure::Forbidden("You are banned from this server"));
    }
    let members = workspace.members.entry(server_id.to_owned()).or_default();
    if members.contains_key(&user_id) {
        return Ok(JoinOutcome::AlreadyMember);
    }
    members.insert(user_id, member);
    Ok(JoinOutcome::Joined)
}

/// Drops a membership row; returns whether one existed.
pub(crate) async fn remove_member(
    state: &AppState,
    server_id: &str,
    user_id: UserId,
) -> Result<bool, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let removed = sqlx::query("DELETE FROM server_members WHERE server_id = $1 AND user_id = $2")
            .bind(server_id)
            .bind(user_id.to_string())
            .execute(pool)
            .await?
            .rows_affected();
        return Ok(removed > 0);
    }
    Ok(state
        .workspace
        .write()
        .await
        .members
        .get_mut(server_id)
        .and_then(|members| members.remove(&user_id))
        .is_some())
}

/// Removes the target's membership and records the ban in one step.
pub(crate) async fn ban_member(
    state: &AppState,
    server_id: &str,
    target: UserId,
    ban: ServerBanRecord,
) -> Result<(), ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM server_members WHERE server_id = $1 AND user_id = $2")
            .bind(server_id)
            .bind(target.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO server_bans
                (server_id, banned_user_id, banned_by_user_id, reason, created_at_ms)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (server_id, banned_user_id) DO UPDATE
             SET banned_by_user_id = EXCLUDED.banned_by_user_id,
                 reason = EXCLUDED.reason,
                 created_at_ms = EXCLUDED.created_at_ms",
        )
        .bind(server_id)
        .bind(target.to_string())
        .bind(ban.banned_by_user_id.to_string())
        .bind(&ban.reason)
        .bind(ban.created_at_ms)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        return Ok(());
    }

    let mut workspace = state.workspace.write().await;
    if let Some(members) = workspace.members.get_mut(server_id) {
        members.remove(&target);
    }
    workspace
        .bans
        .entry(server_id.to_owned())
        .or_default()
        .insert(target, ban);
    Ok(())
}

/// Returns `false` when the user is not a member.
pub(crate) async fn set_member_muted(
    state: &AppState,
    server_id: &str,
    user_id: UserId,
    muted: bool,
) -> Result<bool, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let updated = sqlx::query(
            "UPDATE server_members SET muted = $3 WHERE server_id = $1 AND user_id = $2",
        )
        .bind(server_id)
        .bind(user_id.to_string())
        .bind(muted)
        .execute(pool)
        .await?
        .rows_affected();
        return Ok(updated > 0);
    }
    let mut workspace = state.workspace.write().await;
    let Some(member) = workspace
        .members
        .get_mut(server_id)
        .and_then(|members| members.get_mut(&user_id))
    else {
        return Ok(false);
    };
    member.muted = muted;
    Ok(true)
}

pub(crate) async fn update_server(
    state: &AppState,
    server_id: &str,
    changes: ServerChanges<'_>,
) -> Result<ServerRecord, ApiFailure> {
    let name = changes.name.map(|name| name.as_str().to_owned());
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!(
            "UPDATE servers
             SET name = COALESCE($2, name), is_public = COALESCE($3, is_public)
             WHERE server_id = $1
             RETURNING {SERVER_COLUMNS}"
        ))
        .bind(server_id)
        .bind(name)
        .bind(changes.is_public)
        .fetch_optional(pool)
        .await?;
        return row
            .as_ref()
            .map(server_from_row)
            .transpose()?
            .ok_or(ApiFailure::NotFound("Server not found"));
    }

    let mut workspace = state.workspace.write().await;
    let server = workspace
        .servers
        .get_mut(server_id)
        .ok_or(ApiFailure::NotFound("Server not found"))?;
    if let Some(name) = name {
        server.name = name;
    }
    if let Some(is_public) = changes.is_public {
        server.is_public = is_public;
    }
    Ok(server.clone())
}

/// Replaces the icon key and returns the previous one.
pub(crate) async fn set_server_icon(
    state: &AppState,
    server_id: &str,
    icon_key: Option<&str>,
) -> Result<Option<String>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(
            "UPDATE servers s SET icon_key = $2
             FROM (SELECT server_id, icon_key FROM servers WHERE server_id = $1 FOR UPDATE) previous
             WHERE s.server_id = previous.server_id
             RETURNING previous.icon_key AS previous_key",
        )
        .bind(server_id)
        .bind(icon_key)
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            return Err(ApiFailure::NotFound("Server not found"));
        };
        return Ok(row.try_get("previous_key")?);
    }

    let mut workspace = state.workspace.write().await;
    let server = workspace
        .servers
        .get_mut(server_id)
        .ok_or(ApiFailure::NotFound("Server not found"))?;
    Ok(std::mem::replace(
        &mut server.icon_key,
        icon_key.map(str::to_owned),
    ))
}

/// Issues a fresh invite key; links carrying the old one stop resolving.
pub(crate) async fn regenerate_invite_key(
    state: &AppState,
    server_id: &str,
) -> Result<String, ApiFailure> {
    let invite_key = random_token();
    if let Some(pool) = ready_pool(state).await? {
        let updated = sqlx::query("UPDATE servers SET invite_key = $2 WHERE server_id = $1")
            .bind(server_id)
            .bind(&invite_key)
            .execute(pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(ApiFailure::NotFound("Server not found"));
        }
        return Ok(invite_key);
    }

    let mut workspace = state.workspace.write().await;
    let server = workspace
        .servers
        .get_mut(server_id)
        .ok_or(ApiFailure::NotFound("Server not found"))?;
    server.invite_key.clone_from(&invite_key);
    Ok(invite_key)
}

/// Loads a server and rejects moderation aimed at its owner.
pub(crate) async fn moderation_target(
    state: &AppState,
    server_id: &str,
    target: UserId,
) -> Result<ServerRecord, ApiFailure> {
    let server = load_server(state, server_id)
        .await?
        .ok_or(ApiFailure::NotFound("Server not found"))?;
    if server.owner_id == target {
        return Err(ApiFailure::InvalidRequest(
            "The server owner cannot be moderated",
        ));
    }
    Ok(server)
}
