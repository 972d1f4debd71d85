//! Liveness endpoint for container orchestration probes.

use axum::{routing::get, Router};
use tracing::info;

async fn healthz() -> &'static str {
    "ok"
}

async fn banner() -> &'static str {
    "kiroku: guild memory bot"
}

pub async fn serve(port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .fallback(banner);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("health endpoint listening on :{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
