//! Prometheus scrape endpoint on its own listener.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::observability::MetricsRegistry;

pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn metrics_router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(registry)
}

async fn render_metrics(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    ([(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], registry.render())
}

/// Serve `/metrics` until the shutdown broadcast fires.
pub async fn serve_metrics(
    listener: TcpListener,
    registry: Arc<MetricsRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Metrics endpoint starting");

    axum::serve(listener, metrics_router(registry))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Metrics endpoint stopped");
    Ok(())
}
