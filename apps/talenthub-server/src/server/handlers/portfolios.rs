use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use sqlx::{postgres::PgRow, Row};
use talenthub_core::{PortfolioSlug, UserId};
use talenthub_protocol::ApiEnvelope;
use ulid::Ulid;

use crate::server::{
    auth::{authenticate, now_unix_ms, random_bytes},
    core::{AppState, PortfolioRecord, MAX_SLUG_ATTEMPTS},
    db::{is_unique_violation, ready_pool},
    domain::user_summaries,
    errors::ApiFailure,
    types::{
        CreatePortfolioRequest, PortfolioIdRequest, PortfolioResponse, PortfolioSlugRequest,
        PublicPortfolioResponse, UpdatePortfolioRequest,
    },
};

const PORTFOLIO_COLUMNS: &str =
    "portfolio_id, user_id, slug, name, title, summary, created_at_ms, updated_at_ms";
const MAX_PORTFOLIO_NAME_CHARS: usize = 100;
const MAX_PORTFOLIO_TITLE_CHARS: usize = 120;
const MAX_PORTFOLIO_SUMMARY_CHARS: usize = 5_000;

fn portfolio_from_row(row: &PgRow) -> Result<PortfolioRecord, ApiFailure> {
    let user_id: String = row.try_get("user_id")?;
    Ok(PortfolioRecord {
        portfolio_id: row.try_get("portfolio_id")?,
        user_id: UserId::try_from(user_id).map_err(|_| ApiFailure::Internal)?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

fn required_text(
    value: &str,
    max_chars: usize,
    message: &'static str,
) -> Result<String, ApiFailure> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.chars().count() > max_chars {
        return Err(ApiFailure::InvalidRequest(message));
    }
    Ok(trimmed.to_owned())
}

fn summary_text(value: &str) -> Result<String, ApiFailure> {
    let trimmed = value.trim();
    if trimmed.chars().count() > MAX_PORTFOLIO_SUMMARY_CHARS {
        return Err(ApiFailure::InvalidRequest(
            "Summary must be at most 5000 characters",
        ));
    }
    Ok(trimmed.to_owned())
}

fn portfolio_name(value: &str) -> Result<String, ApiFailure> {
    required_text(
        value,
        MAX_PORTFOLIO_NAME_CHARS,
        "Name must be between 1 and 100 characters",
    )
}

fn portfolio_title(value: &str) -> Result<String, ApiFailure> {
    required_text(
        value,
        MAX_PORTFOLIO_TITLE_CHARS,
        "Title must be between 1 and 120 characters",
    )
}

async fn load_portfolio(
    state: &AppState,
    portfolio_id: &str,
) -> Result<Option<PortfolioRecord>, ApiFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!(
            "SELECT {PORTFOLIO_COLUMNS} FROM portfolios WHERE portfolio_id = $1"
        ))
        .bind(portfolio_id)
        .fetch_optional(pool)
        .await?;
        return row.as_ref().map(portfolio_from_row).transpose();
    }
    Ok(state.portfolios.read().await.get(portfolio_id).cloned())
}

/// Portfolio owned by `user_id`; someone else's is refused.
async fn owned_portfolio(
    state: &AppState,
    portfolio_id: &str,
    user_id: UserId,
) -> Result<PortfolioRecord, ApiFailure> {
    let portfolio = load_portfolio(state, portfolio_id)
        .await?
        .ok_or(ApiFailure::NotFound("Portfolio not found"))?;
    if portfolio.user_id != user_id {
        return Err(ApiFailure::Forbidden("Not authorized"));
    }
    Ok(portfolio)
}

/// Inserts under a fresh random slug, drawing again on a slug collision.
async fn insert_with_unique_slug(
    state: &AppState,
    mut portfolio: PortfolioRecord,
) -> Result<PortfolioRecord, ApiFailure> {
    for _ in 0..MAX_SLUG_ATTEMPTS {
        portfolio.slug = PortfolioSlug::from_random_bytes(random_bytes::<16>())
            .as_str()
            .to_owned();

        if let Some(pool) = ready_pool(state).await? {
            let inserted = sqlx::query(
                "INSERT INTO portfolios
                    (portfolio_id, user_id, slug, name, title, summary, created_at_ms, updated_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&portfolio.portfolio_id)
            .bind(portfolio.user_id.to_string())
            .bind(&portfolio.slug)
            .bind(&portfolio.name)
            .bind(&portfolio.title)
            .bind(&portfolio.summary)
            .bind(portfolio.created_at_ms)
            .bind(portfolio.updated_at_ms)
            .execute(pool)
            .await;
            match inserted {
                Ok(_) => return Ok(portfolio),
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let mut portfolios = state.portfolios.write().await;
        if portfolios.values().any(|existing| existing.slug == portfolio.slug) {
            continue;
        }
        portfolios.insert(portfolio.portfolio_id.clone(), portfolio.clone());
        return Ok(portfolio);
    }

    tracing::error!(event = "portfolios.create", outcome = "slug_exhausted");
    Err(ApiFailure::Internal)
}

pub(crate) async fn list_portfolios(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<PortfolioResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let portfolios = if let Some(pool) = ready_pool(&state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {PORTFOLIO_COLUMNS} FROM portfolios
             WHERE user_id = $1
             ORDER BY created_at_ms DESC, portfolio_id DESC"
        ))
        .bind(auth.user_id.to_string())
        .fetch_all(pool)
        .await?;
        rows.iter()
            .map(portfolio_from_row)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let mut owned: Vec<PortfolioRecord> = state
            .portfolios
            .read()
            .await
            .values()
            .filter(|portfolio| portfolio.user_id == auth.user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.portfolio_id.cmp(&a.portfolio_id))
        });
        owned
    };
    Ok(Json(ApiEnvelope::ok(
        portfolios.iter().map(PortfolioResponse::from).collect(),
    )))
}

pub(crate) async fn create_portfolio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePortfolioRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<PortfolioResponse>>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let now = now_unix_ms();
    let portfolio = insert_with_unique_slug(
        &state,
        PortfolioRecord {
            portfolio_id: Ulid::new().to_string(),
            user_id: auth.user_id,
            slug: String::new(),
            name: portfolio_name(&payload.name)?,
            title: portfolio_title(&payload.title)?,
            summary: summary_text(&payload.summary)?,
            created_at_ms: now,
            updated_at_ms: now,
        },
    )
    .await?;
    tracing::info!(
        event = "portfolios.create",
        user_id = %auth.user_id,
        portfolio_id = %portfolio.portfolio_id
    );
    Ok((
        StatusCode::CREATED,
        Json(ApiEnvelope::ok(PortfolioResponse::from(&portfolio))),
    ))
}

pub(crate) async fn update_portfolio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePortfolioRequest>,
) -> Result<Json<ApiEnvelope<PortfolioResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let name = payload.name.as_deref().map(portfolio_name).transpose()?;
    let title = payload.title.as_deref().map(portfolio_title).transpose()?;
    let summary = payload.summary.as_deref().map(summary_text).transpose()?;
    let mut portfolio = owned_portfolio(&state, &payload.portfolio_id, auth.user_id).await?;

    if let Some(name) = name {
        portfolio.name = name;
    }
    if let Some(title) = title {
        portfolio.title = title;
    }
    if let Some(summary) = summary {
        portfolio.summary = summary;
    }
    portfolio.updated_at_ms = now_unix_ms();

    if let Some(pool) = ready_pool(&state).await? {
        sqlx::query(
            "UPDATE portfolios SET name = $2, title = $3, summary = $4, updated_at_ms = $5
             WHERE portfolio_id = $1",
        )
        .bind(&portfolio.portfolio_id)
        .bind(&portfolio.name)
        .bind(&portfolio.title)
        .bind(&portfolio.summary)
        .bind(portfolio.updated_at_ms)
        .execute(pool)
        .await?;
    } else {
        state
            .portfolios
            .write()
            .await
            .insert(portfolio.portfolio_id.clone(), portfolio.clone());
    }
    Ok(Json(ApiEnvelope::ok(PortfolioResponse::from(&portfolio))))
}

pub(crate) async fn delete_portfolio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PortfolioIdRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let portfolio = owned_portfolio(&state, &payload.portfolio_id, auth.user_id).await?;
    if let Some(pool) = ready_pool(&state).await? {
        sqlx::query("DELETE FROM portfolios WHERE portfolio_id = $1")
            .bind(&portfolio.portfolio_id)
            .execute(pool)
            .await?;
    } else {
        state.portfolios.write().await.remove(&portfolio.portfolio_id);
    }
    tracing::info!(
        event = "portfolios.delete",
        portfolio_id = %portfolio.portfolio_id
    );
    Ok(Json(ApiEnvelope::done("Portfolio deleted")))
}

/// Public portfolio page; needs no session.
pub(crate) async fn portfolio_by_slug(
    State(state): State<AppState>,
    Json(payload): Json<PortfolioSlugRequest>,
) -> Result<Json<ApiEnvelope<PublicPortfolioResponse>>, ApiFailure> {
    let slug = PortfolioSlug::try_from(payload.slug)
        .map_err(|_| ApiFailure::NotFound("Portfolio not found"))?;
    let portfolio = if let Some(pool) = ready_pool(&state).await? {
        let row = sqlx::query(&format!(
            "SELECT {PORTFOLIO_COLUMNS} FROM portfolios WHERE slug = $1"
        ))
        .bind(slug.as_str())
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(portfolio_from_row).transpose()?
    } else {
        state
            .portfolios
            .read()
            .await
            .values()
            .find(|portfolio| portfolio.slug == slug.as_str())
            .cloned()
    }
    .ok_or(ApiFailure::NotFound("Portfolio not found"))?;

    let mut owners = user_summaries(&state, [portfolio.user_id]).await?;
    Ok(Json(ApiEnvelope::ok(PublicPortfolioResponse {
        owner: owners.remove(&portfolio.user_id),
        portfolio: PortfolioResponse::from(&portfolio),
    })))
}

#[cfg(test)]
mod tests {
    use super::{portfolio_name, summary_text};

    #[test]
    fn names_are_trimmed_and_bounded() {
        assert_eq!(portfolio_name("  Jane Doe ").ok().as_deref(), Some("Jane Doe"));
        assert!(portfolio_name("   ").is_err());
        assert!(portfolio_name(&"x".repeat(101)).is_err());
        assert_eq!(summary_text("").ok().as_deref(), Some(""));
        assert!(summary_text(&"x".repeat(5_001)).is_err());
    }
}
