//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the inventory handlers
//! - Wire up middleware (request ID, instrumentation, panic recovery, timeout)
//! - Bind server to listener
//! - Stop accepting on the shutdown broadcast and drain in-flight requests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::ServiceConfig;
use crate::http::handlers;
use crate::http::middleware::instrument;
use crate::inventory::ProductStore;
use crate::observability::Observability;

/// Request bodies above this size are rejected.
pub const MAX_BODY_BYTES: usize = 1_048_576;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub obs: Arc<Observability>,
    pub store: Arc<dyn ProductStore>,
}

/// HTTP server for the inventory API.
pub struct HttpServer {
    router: Router,
    config: ServiceConfig,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ServiceConfig, obs: Arc<Observability>, store: Arc<dyn ProductStore>) -> Self {
        let timeout = Duration::from_secs(config.timeouts.request_secs);
        let router = build_router(AppState { obs, store }, timeout);
        Self { router, config }
    }

    /// The fully layered router, for driving without a listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server received shutdown signal, draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

/// Build the Axum router with all middleware layers.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let obs = state.obs.clone();

    let router = Router::new()
        .route("/products", get(handlers::list_products))
        .route("/product", post(handlers::create_product))
        .route(
            "/product/{id}",
            get(handlers::get_product)
                .put(handlers::update_product)
                .delete(handlers::delete_product),
        )
        .route("/health", get(handlers::health))
        .fallback(handlers::route_not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state);

    instrument(router, obs, request_timeout)
}
