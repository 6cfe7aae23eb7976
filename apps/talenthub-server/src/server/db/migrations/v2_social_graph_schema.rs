use sqlx::{Postgres, Transaction};

const CREATE_FRIEND_REQUESTS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS friend_requests (
                    request_id TEXT PRIMARY KEY,
                    sender_user_id TEXT NOT NULL,
                    receiver_user_id TEXT NOT NULL,
                    pair_key TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    created_at_ms BIGINT NOT NULL,
                    CHECK (sender_user_id <> receiver_user_id),
                    CHECK (status IN ('pending', 'accepted', 'denied'))
                )";
const CREATE_FRIEND_REQUESTS_SENDER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_friend_requests_sender
                    ON friend_requests(sender_user_id, status)";
const CREATE_FRIEND_REQUESTS_RECEIVER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_friend_requests_receiver
                    ON friend_requests(receiver_user_id, status)";

pub(crate) async fn apply_social_graph_schema(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_FRIEND_REQUESTS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;

    sqlx::query(CREATE_FRIEND_REQUESTS_SENDER_INDEX_SQL)
        .execute(&mut **tx)
        .await?;

    sqlx::query(CREATE_FRIEND_REQUESTS_RECEIVER_INDEX_SQL)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        CREATE_FRIEND_REQUESTS_RECEIVER_INDEX_SQL, CREATE_FRIEND_REQUESTS_SENDER_INDEX_SQL,
        CREATE_FRIEND_REQUESTS_TABLE_SQL,
    };

    #[test]
    fn social_graph_schema_keeps_one_request_per_pair() {
        assert!(CREATE_FRIEND_REQUESTS_TABLE_SQL
            .contains("CREATE TABLE IF NOT EXISTS friend_requests"));
        assert!(CREATE_FRIEND_REQUESTS_TABLE_SQL.contains("pair_key TEXT NOT NULL UNIQUE"));
        assert!(CREATE_FRIEND_REQUESTS_TABLE_SQL
            .contains("CHECK (sender_user_id <> receiver_user_id)"));
        assert!(CREATE_FRIEND_REQUESTS_SENDER_INDEX_SQL.contains("idx_friend_requests_sender"));
        assert!(
            CREATE_FRIEND_REQUESTS_RECEIVER_INDEX_SQL.contains("idx_friend_requests_receiver")
        );
    }
}
