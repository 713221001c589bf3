use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;

/// Binds `bind` and serves `app` until `cancel` fires, draining in-flight requests.
pub async fn serve(bind: &str, app: Router, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {bind}"))?;
    tracing::info!(bind = %bind, "HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("HTTP server failed")
}
