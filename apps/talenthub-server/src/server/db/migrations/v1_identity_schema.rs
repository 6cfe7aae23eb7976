use sqlx::{Postgres, Transaction};

const CREATE_USERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
                    user_id TEXT PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    username TEXT NOT NULL UNIQUE,
                    display_name TEXT NOT NULL,
                    password_hash TEXT NOT NULL,
                    avatar_key TEXT NULL,
                    session_epoch BIGINT NOT NULL DEFAULT 0,
                    created_at_ms BIGINT NOT NULL
                )";
const CREATE_PENDING_VERIFICATIONS_TABLE_SQL: &str =
    "CREATE TABLE IF NOT EXISTS pending_verifications (
                    email TEXT PRIMARY KEY,
                    username TEXT NOT NULL,
                    display_name TEXT NOT NULL,
                    password_hash TEXT NOT NULL,
                    code TEXT NOT NULL,
                    expires_at_unix BIGINT NOT NULL
                )";

pub(crate) async fn apply_identity_schema(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_USERS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;

    sqlx::query(CREATE_PENDING_VERIFICATIONS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
