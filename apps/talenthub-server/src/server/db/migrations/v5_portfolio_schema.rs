use sqlx::{Postgres, Transaction};

const CREATE_PORTFOLIOS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS portfolios (
                    portfolio_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    title TEXT NOT NULL,
                    summary TEXT NOT NULL DEFAULT '',
                    created_at_ms BIGINT NOT NULL,
                    updated_at_ms BIGINT NOT NULL
                )";
const CREATE_PORTFOLIOS_USER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_portfolios_user_created
                    ON portfolios(user_id, created_at_ms DESC)";

pub(crate) async fn apply_portfolio_schema(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_PORTFOLIOS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;

    sqlx::query(CREATE_PORTFOLIOS_USER_INDEX_SQL)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{CREATE_PORTFOLIOS_TABLE_SQL, CREATE_PORTFOLIOS_USER_INDEX_SQL};

    #[test]
    fn portfolio_schema_keeps_slugs_unique() {
        assert!(CREATE_PORTFOLIOS_TABLE_SQL.contains("slug TEXT NOT NULL UNIQUE"));
        assert!(CREATE_PORTFOLIOS_USER_INDEX_SQL.contains("idx_portfolios_user_created"));
    }
}
