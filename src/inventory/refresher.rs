//! Periodic refresh of the product-count gauge.
//!
//! # Responsibilities
//! - Recompute `products_in_db` at start and then on every tick
//! - Bound each count with a timeout
//! - Stop when the shutdown broadcast fires
//!
//! # Design Decisions
//! - A failed refresh keeps the last good value; no retry before the next tick
//! - Each refresh is its own root trace on the storage identity

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::Context;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::inventory::store::{ProductCounter, StoreError};
use crate::observability::{profiled, Observability};

pub struct ProductCountRefresher {
    obs: Arc<Observability>,
    counter: Arc<dyn ProductCounter>,
    interval: Duration,
    timeout: Duration,
}

impl ProductCountRefresher {
    pub fn new(
        obs: Arc<Observability>,
        counter: Arc<dyn ProductCounter>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            obs,
            counter,
            interval,
            timeout,
        }
    }

    /// Refresh immediately, then every interval until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "Product count refresher starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Errors are already logged and counted.
                    let _ = self.refresh_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Product count refresher received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One refresh. On success the gauge is set to the count.
    pub async fn refresh_once(&self) -> Result<u64, StoreError> {
        let cx = self.obs.storage_context(&Context::new());
        let timeout = self.timeout;
        let counter = &self.counter;

        let result = profiled(&cx, "count_products", 0, |_| async move {
            match time::timeout(timeout, counter.count()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(timeout)),
            }
        })
        .await;

        match result {
            Ok(count) => {
                self.obs.metrics().set_products(count);
                tracing::debug!(products = count, "Product count refreshed");
                Ok(count)
            }
            Err(e) => {
                self.obs.metrics().storage_error();
                tracing::warn!(error = %e, "Failed to refresh product count");
                Err(e)
            }
        }
    }
}
