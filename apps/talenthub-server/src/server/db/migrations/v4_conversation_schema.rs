use sqlx::{Postgres, Transaction};

const CREATE_CONVERSATIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS conversations (
                    conversation_id TEXT PRIMARY KEY,
                    kind SMALLINT NOT NULL,
                    server_id TEXT NULL,
                    channel_id TEXT NULL,
                    dm_key TEXT NULL,
                    last_message_id TEXT NULL,
                    last_message_at_ms BIGINT NULL,
                    created_at_ms BIGINT NOT NULL,
                    CHECK (
                        (kind = 1 AND server_id IS NOT NULL AND dm_key IS NULL)
                        OR (kind = 2 AND dm_key IS NOT NULL AND server_id IS NULL AND channel_id IS NULL)
                    )
                )";
const CREATE_CONVERSATIONS_CHANNEL_UNIQUE_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_channel_unique
                    ON conversations(channel_id) WHERE channel_id IS NOT NULL";
const CREATE_CONVERSATIONS_DM_KEY_UNIQUE_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_dm_key_unique
                    ON conversations(dm_key) WHERE dm_key IS NOT NULL";
const CREATE_CONVERSATIONS_ORPHAN_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_conversations_channel_orphans
                    ON conversations(server_id, created_at_ms)
                    WHERE kind = 1 AND channel_id IS NULL";
const CREATE_CONVERSATION_MEMBERS_TABLE_SQL: &str =
    "CREATE TABLE IF NOT EXISTS conversation_members (
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    last_read_message_id TEXT NULL,
                    last_read_at_ms BIGINT NULL,
                    muted BOOLEAN NOT NULL DEFAULT FALSE,
                    pinned BOOLEAN NOT NULL DEFAULT FALSE,
                    joined_at_ms BIGINT NOT NULL,
                    PRIMARY KEY(conversation_id, user_id)
                )";
const CREATE_CONVERSATION_MEMBERS_USER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_conversation_members_user
                    ON conversation_members(user_id)";
const CREATE_MESSAGES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                    sender_user_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    reply_to_message_id TEXT NULL,
                    attachments_json TEXT NOT NULL DEFAULT '[]',
                    edited_at_ms BIGINT NULL,
                    deleted_at_ms BIGINT NULL,
                    created_at_ms BIGINT NOT NULL,
                    CHECK (kind IN ('text', 'image', 'file', 'deleted'))
                )";
const CREATE_MESSAGES_TIMELINE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_timeline
                    ON messages(conversation_id, created_at_ms DESC, message_id DESC)";

pub(crate) async fn apply_conversation_schema(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    for statement in [
        CREATE_CONVERSATIONS_TABLE_SQL,
        CREATE_CONVERSATIONS_CHANNEL_UNIQUE_INDEX_SQL,
        CREATE_CONVERSATIONS_DM_KEY_UNIQUE_INDEX_SQL,
        CREATE_CONVERSATIONS_ORPHAN_INDEX_SQL,
        CREATE_CONVERSATION_MEMBERS_TABLE_SQL,
        CREATE_CONVERSATION_MEMBERS_USER_INDEX_SQL,
        CREATE_MESSAGES_TABLE_SQL,
        CREATE_MESSAGES_TIMELINE_INDEX_SQL,
    ] {
        sqlx::query(statement).execute(&mut **tx).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        CREATE_CONVERSATIONS_CHANNEL_UNIQUE_INDEX_SQL, CREATE_CONVERSATIONS_DM_KEY_UNIQUE_INDEX_SQL,
        CREATE_CONVERSATIONS_TABLE_SQL, CREATE_CONVERSATION_MEMBERS_TABLE_SQL,
        CREATE_MESSAGES_TIMELINE_INDEX_SQL,
    };

    #[test]
    fn conversation_identity_is_unique_per_channel_and_dm_key() {
        assert!(CREATE_CONVERSATIONS_CHANNEL_UNIQUE_INDEX_SQL
            .contains("ON conversations(channel_id) WHERE channel_id IS NOT NULL"));
        assert!(CREATE_CONVERSATIONS_DM_KEY_UNIQUE_INDEX_SQL
            .contains("ON conversations(dm_key) WHERE dm_key IS NOT NULL"));
        assert!(CREATE_CONVERSATIONS_TABLE_SQL.contains("kind = 2 AND dm_key IS NOT NULL"));
    }

    #[test]
    fn message_timeline_index_matches_listing_order() {
        assert!(CREATE_MESSAGES_TIMELINE_INDEX_SQL
            .contains("(conversation_id, created_at_ms DESC, message_id DESC)"));
        assert!(CREATE_CONVERSATION_MEMBERS_TABLE_SQL
            .contains("PRIMARY KEY(conversation_id, user_id)"));
    }
}
