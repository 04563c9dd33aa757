//! Inventory service.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌───────────────────────────────────────────────────┐
//!                         │                 INVENTORY SERVICE                  │
//!                         │                                                    │
//!     Client Request      │  ┌──────────────┐    ┌──────────┐    ┌──────────┐  │
//!     ────────────────────┼─▶│ instrument   │───▶│ handlers │───▶│  store   │  │
//!                         │  │ (span, gauge,│    │ profiled │    │          │  │
//!     Client Response     │  │  metrics,log)│◀───│  spans   │◀───│          │  │
//!     ◀───────────────────┼──└──────────────┘    └──────────┘    └────┬─────┘  │
//!                         │                                           │        │
//!                         │  ┌──────────────┐    ┌──────────────┐     │        │
//!     Prometheus scrape ──┼─▶│  /metrics    │    │  refresher   │◀────┘        │
//!                         │  └──────────────┘    └──────────────┘              │
//!                         │                                                    │
//!                         │  application + storage tracer providers ──▶ OTLP   │
//!                         │  continuous profiler ─────────────────────▶ ingest │
//!                         └───────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use inventory_telemetry::config::load_config;
use inventory_telemetry::http::{serve_metrics, HttpServer};
use inventory_telemetry::inventory::{InMemoryStore, ProductCountRefresher, ProductCounter, ProductStore};
use inventory_telemetry::lifecycle::{wait_for_signal, Shutdown};
use inventory_telemetry::observability::{init_logging, MetricsRegistry, Observability, ServiceMetrics, TracerProviderManager};
use inventory_telemetry::profiling::{self, InstrumentedAllocator, INSTRUMENTED_SYSTEM};

#[global_allocator]
static ALLOCATOR: &InstrumentedAllocator = &INSTRUMENTED_SYSTEM;

const PROFILER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "inventory-service", version, about = "Inventory HTTP service")]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.observability)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "inventory-service starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        metrics_address = %config.observability.metrics_address,
        collector = %config.tracing.endpoint,
        failure_policy = %config.tracing.failure_policy,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    let profiler = profiling::start_or_disable(&config.profiling, &config.tracing);

    let tracers = match TracerProviderManager::from_config(&config.tracing).await {
        Ok(tracers) => tracers,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize tracing");
            return Err(e.into());
        }
    };
    tracers.install_global();

    let registry = Arc::new(MetricsRegistry::new()?);
    let metrics = ServiceMetrics::register(registry.clone())?;
    let obs = Arc::new(Observability::new(metrics, &tracers)?);

    let store = Arc::new(InMemoryStore::new());
    let shutdown = Shutdown::new();

    // Bind both listeners before anything is spawned.
    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let metrics_listener = if config.observability.metrics_enabled {
        Some(TcpListener::bind(&config.observability.metrics_address).await?)
    } else {
        None
    };

    if config.refresher.enabled {
        let counter: Arc<dyn ProductCounter> = store.clone();
        let refresher = ProductCountRefresher::new(
            obs.clone(),
            counter,
            Duration::from_secs(config.refresher.interval_secs),
            Duration::from_secs(config.refresher.timeout_secs),
        );
        shutdown.spawn("product-count-refresher", refresher.run(shutdown.subscribe()));
    }

    if let Some(metrics_listener) = metrics_listener {
        let rx = shutdown.subscribe();
        shutdown.spawn("metrics-endpoint", async move {
            if let Err(e) = serve_metrics(metrics_listener, registry, rx).await {
                tracing::error!(error = %e, "Metrics endpoint failed");
            }
        });
    }

    let product_store: Arc<dyn ProductStore> = store;
    let server = HttpServer::new(config.clone(), obs, product_store);
    let rx = shutdown.subscribe();
    shutdown.spawn("http-server", async move {
        if let Err(e) = server.run(listener, rx).await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    let signal = wait_for_signal().await;
    tracing::info!(signal = %signal, "Shutdown signal received");

    shutdown.trigger();
    let aborted = shutdown.drain(Duration::from_secs(config.shutdown.grace_secs)).await;
    if aborted > 0 {
        tracing::warn!(aborted, "Some background tasks were aborted");
    }

    if let Err(e) = tracers.shutdown().await {
        tracing::error!(error = %e, "Tracer shutdown incomplete");
    }

    if let Some(profiler) = profiler {
        profiler.stop(PROFILER_STOP_TIMEOUT).await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
