use sqlx::{Postgres, Transaction};

mod v1_identity_schema;
mod v2_social_graph_schema;
mod v3_workspace_schema;
mod v4_conversation_schema;
mod v5_portfolio_schema;

/// Applies every schema step in version order. Each step is idempotent.
pub(crate) async fn apply_all(tx: &mut Transaction<'_, Postgres>) -> Result<(), sqlx::Error> {
    v1_identity_schema::apply_identity_schema(tx).await?;
    v2_social_graph_schema::apply_social_graph_schema(tx).await?;
    v3_workspace_schema::apply_workspace_schema(tx).await?;
    v4_conversation_schema::apply_conversation_schema(tx).await?;
    v5_portfolio_schema::apply_portfolio_schema(tx).await?;
    Ok(())
}
