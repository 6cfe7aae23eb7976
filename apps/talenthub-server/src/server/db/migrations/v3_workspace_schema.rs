use sqlx::{Postgres, Transaction};

const CREATE_SERVERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS servers (
                    server_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    icon_key TEXT NULL,
                    owner_user_id TEXT NOT NULL,
                    is_public BOOLEAN NOT NULL DEFAULT FALSE,
                    invite_key TEXT NOT NULL UNIQUE,
                    created_at_ms BIGINT NOT NULL
                )";
const CREATE_SERVER_MEMBERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS server_members (
                    server_id TEXT NOT NULL REFERENCES servers(server_id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    roles TEXT[] NOT NULL DEFAULT '{}',
                    muted BOOLEAN NOT NULL DEFAULT FALSE,
                    joined_at_ms BIGINT NOT NULL,
                    PRIMARY KEY(server_id, user_id)
                )";
const CREATE_SERVER_MEMBERS_USER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_server_members_user ON server_members(user_id)";
const CREATE_SERVER_BANS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS server_bans (
                    server_id TEXT NOT NULL REFERENCES servers(server_id) ON DELETE CASCADE,
                    banned_user_id TEXT NOT NULL,
                    banned_by_user_id TEXT NOT NULL,
                    reason TEXT NULL,
                    created_at_ms BIGINT NOT NULL,
                    PRIMARY KEY(server_id, banned_user_id)
                )";
const CREATE_CHANNELS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS channels (
                    channel_id TEXT PRIMARY KEY,
                    server_id TEXT NOT NULL REFERENCES servers(server_id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'text',
                    channel_key TEXT NULL UNIQUE,
                    created_at_ms BIGINT NOT NULL
                )";
const CREATE_CHANNELS_SERVER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_channels_server_created
                    ON channels(server_id, created_at_ms)";

pub(crate) async fn apply_workspace_schema(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    for statement in [
        CREATE_SERVERS_TABLE_SQL,
        CREATE_SERVER_MEMBERS_TABLE_SQL,
        CREATE_SERVER_MEMBERS_USER_INDEX_SQL,
        CREATE_SERVER_BANS_TABLE_SQL,
        CREATE_CHANNELS_TABLE_SQL,
        CREATE_CHANNELS_SERVER_INDEX_SQL,
    ] {
        sqlx::query(statement).execute(&mut **tx).await?;
    }

    Ok(())
}
