#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use talenthub_server::{build_router, init_tracing, AppConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let database_url = std::env::var("TALENTHUB_DATABASE_URL").ok();
    if database_url.is_none() {
        tracing::warn!("TALENTHUB_DATABASE_URL unset; state is kept in memory only");
    }
    let token_key = std::env::var("TALENTHUB_TOKEN_KEY")
        .map_err(|_| anyhow::anyhow!("TALENTHUB_TOKEN_KEY is required for runtime"))?;
    let realtime_secret = std::env::var("TALENTHUB_REALTIME_SECRET")
        .map_err(|_| anyhow::anyhow!("TALENTHUB_REALTIME_SECRET is required for runtime"))?;
    let storage_signing_key = std::env::var("TALENTHUB_STORAGE_SIGNING_KEY")
        .map_err(|_| anyhow::anyhow!("TALENTHUB_STORAGE_SIGNING_KEY is required for runtime"))?;
    let log_verification_codes = std::env::var("TALENTHUB_LOG_VERIFICATION_CODES")
        .map_or(Ok(false), |value| {
            value.parse::<bool>().map_err(|e| {
                anyhow::anyhow!("invalid TALENTHUB_LOG_VERIFICATION_CODES value {value:?}: {e}")
            })
        })?;
    let app_config = AppConfig {
        storage_root: std::env::var("TALENTHUB_STORAGE_ROOT")
            .map_or_else(|_| PathBuf::from("./data/storage"), PathBuf::from),
        public_base_url: std::env::var("TALENTHUB_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| String::from("http://127.0.0.1:3000")),
        token_key: Some(token_key),
        storage_signing_key: Some(storage_signing_key),
        realtime_app_key: std::env::var("TALENTHUB_REALTIME_APP_KEY")
            .unwrap_or_else(|_| String::from("talenthub")),
        realtime_secret: Some(realtime_secret),
        mail_api_url: std::env::var("TALENTHUB_MAIL_API_URL").ok(),
        mail_api_key: std::env::var("TALENTHUB_MAIL_API_KEY").ok(),
        mail_from: std::env::var("TALENTHUB_MAIL_FROM")
            .unwrap_or_else(|_| String::from("TalentHub <no-reply@talenthub.local>")),
        log_verification_codes,
        database_url,
        ..AppConfig::default()
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("TALENTHUB_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid TALENTHUB_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, service = talenthub_core::project_name(), "server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
