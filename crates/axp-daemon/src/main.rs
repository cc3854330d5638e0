//! axp-daemon entrypoint: Postgres-backed status API.

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use axp_daemon::{build_router, AppState};
use axp_store::{KvStore, PgKvStore};

const ENV_BIND_ADDR: &str = "AXP_DAEMON_ADDR";

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; absent files are fine.
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let pool = axp_store::connect_from_env().await?;
    axp_store::migrate(&pool).await?;
    let store: Arc<dyn KvStore> = Arc::new(PgKvStore::new(pool));

    let state = Arc::new(AppState::new(store));
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = std::env::var(ENV_BIND_ADDR).unwrap_or_else(|_| "127.0.0.1:8089".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "axp-daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    Ok(())
}
