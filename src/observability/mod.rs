//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Request workers and background tasks produce:
//!     → logging.rs (structured log events, correlated with the current span)
//!     → metrics.rs (counters, gauges, histograms)
//!     → profiler.rs (child spans around storage calls)
//!
//! tracer_provider.rs owns the span pipelines:
//!     application provider ─┐
//!                           ├→ batch processor → OTLP collector
//!     storage provider ─────┘
//!
//! Consumers:
//!     → Log aggregation (stdout JSON)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Distributed tracing collector
//! ```
//!
//! # Design Decisions
//! - One [`Observability`] value is built at startup and shared by `Arc`
//! - Globals (tracer provider, propagator, subscriber) are installed only by the binary
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
pub mod profiler;
pub mod tracer_provider;

use std::fmt;
use std::sync::Arc;

use axum::http::HeaderMap;
use opentelemetry::propagation::{Extractor, Injector, TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::Context;
use opentelemetry_sdk::trace::SdkTracer;

pub use logging::{init_logging, CorrelationContext, SpanEventLayer};
pub use metrics::{MetricHandle, MetricKind, MetricsError, MetricsRegistry, ServiceMetrics};
pub use profiler::{profiled, ActiveTracer};
pub use tracer_provider::{TelemetryError, TracerProviderManager, APPLICATION, STORAGE};

/// Everything request handling needs to report on itself.
pub struct Observability {
    metrics: ServiceMetrics,
    application: SdkTracer,
    storage: SdkTracer,
    propagator: TextMapCompositePropagator,
}

impl fmt::Debug for Observability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observability")
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Observability {
    /// Bind the service metrics to the application and storage tracers.
    pub fn new(metrics: ServiceMetrics, tracers: &TracerProviderManager) -> Result<Self, TelemetryError> {
        Ok(Self {
            metrics,
            application: tracers.tracer(APPLICATION)?,
            storage: tracers.tracer(STORAGE)?,
            propagator: tracer_provider::composite_propagator(),
        })
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        self.metrics.registry()
    }

    /// Tracer for inbound request spans.
    pub fn application_tracer(&self) -> &SdkTracer {
        &self.application
    }

    pub fn storage_tracer(&self) -> &SdkTracer {
        &self.storage
    }

    /// `cx` with the storage tracer as the identity used by [`profiled`].
    pub fn storage_context(&self, cx: &Context) -> Context {
        cx.with_value(ActiveTracer(self.storage.clone()))
    }

    /// Parent context from `traceparent` / `baggage` headers.
    pub fn extract_context(&self, headers: &HeaderMap) -> Context {
        self.propagator.extract(&HeaderExtractor(headers))
    }

    pub fn inject_context(&self, cx: &Context, headers: &mut HeaderMap) {
        self.propagator.inject_context(cx, &mut HeaderInjector(headers));
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let name = axum::http::HeaderName::from_bytes(key.as_bytes());
        let value = axum::http::HeaderValue::from_str(&value);
        if let (Ok(name), Ok(value)) = (name, value) {
            self.0.insert(name, value);
        }
    }
}
