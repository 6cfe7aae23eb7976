use sqlx::PgPool;

use super::{core::AppState, errors::ApiFailure};

mod migrations;

/// Creates the schema once per process, serialized across instances by an advisory lock.
pub(crate) async fn ensure_db_schema(state: &AppState) -> Result<(), ApiFailure> {
    const SCHEMA_INIT_LOCK_ID: i64 = 0x5441_4c45_4e54_4855;
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };

    state
        .db_init
        .get_or_try_init(|| async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(SCHEMA_INIT_LOCK_ID)
                .execute(&mut *tx)
                .await?;

            migrations::apply_all(&mut tx).await?;

            tx.commit().await?;
            tracing::info!(event = "db.init", outcome = "ready");
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|e| {
            tracing::error!(event = "db.init", error = %e);
            ApiFailure::Internal
        })?;

    Ok(())
}

/// Database pool with the schema in place, or `None` for the in-memory backend.
pub(crate) async fn ready_pool(state: &AppState) -> Result<Option<&PgPool>, ApiFailure> {
    ensure_db_schema(state).await?;
    Ok(state.db_pool.as_ref())
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db_error| db_error.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::{ensure_db_schema, is_unique_violation, ready_pool};
    use crate::server::core::{AppConfig, AppState};

    #[tokio::test]
    async fn schema_init_is_noop_and_idempotent_without_database_pool() {
        let state = AppState::new(&AppConfig::default()).expect("app state should initialize");
        ensure_db_schema(&state)
            .await
            .expect("schema init without database should succeed");
        ensure_db_schema(&state)
            .await
            .expect("schema init should be idempotent");
        assert!(ready_pool(&state)
            .await
            .expect("ready pool should resolve")
            .is_none());
    }

    #[test]
    fn non_database_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
