//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Own the process metrics state (one registry per process, one per test)
//! - Register named counters, gauges and histograms with fixed label keys
//! - Bind label values per observation and update atomically
//! - Render the Prometheus text exposition for the scrape endpoint
//!
//! # Metrics
//! - `http_requests_total` (counter): requests by path, method, status
//! - `http_request_duration_seconds` (histogram): latency by path, method
//! - `http_active_connections` (gauge): in-flight requests
//! - `products_in_db` (gauge): product count, refreshed in the background
//! - `sql_errors_total` (counter): storage failures other than not-found
//!
//! # Design Decisions
//! - The Prometheus recorder is owned by the registry, never installed globally
//! - Duplicate registration is an error the caller treats as fatal
//! - Misuse at observation time is logged and dropped, never raised
//! - One bucket set for every histogram, tuned for web latencies

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{Key, KeyName, Label, Level, Metadata, Recorder, SharedString};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use thiserror::Error;

/// Histogram buckets in seconds.
pub const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Route label used when a request matched no registered route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Metric kind, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        };
        f.write_str(name)
    }
}

/// Errors raised while setting up metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error("invalid metric name `{0}`")]
    InvalidName(String),

    #[error("invalid label name `{label}` on metric `{metric}`")]
    InvalidLabel { metric: String, label: String },

    #[error("failed to configure Prometheus recorder: {0}")]
    Recorder(#[from] BuildError),
}

#[derive(Debug)]
struct Descriptor {
    name: String,
    kind: MetricKind,
    label_names: Vec<String>,
}

/// Handle to a registered metric.
///
/// Cheap to clone; carries the label keys so observations only supply values.
#[derive(Debug, Clone)]
pub struct MetricHandle {
    desc: Arc<Descriptor>,
}

impl MetricHandle {
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn kind(&self) -> MetricKind {
        self.desc.kind
    }

    pub fn label_names(&self) -> &[String] {
        &self.desc.label_names
    }
}

/// Process-wide metric state backed by a Prometheus recorder.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    registered: Mutex<HashMap<String, Arc<Descriptor>>>,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// Create a registry whose histograms use [`DURATION_BUCKETS`].
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_buckets(DURATION_BUCKETS)
    }

    /// Create a registry with a custom histogram bucket set.
    pub fn with_buckets(buckets: &[f64]) -> Result<Self, MetricsError> {
        let recorder = PrometheusBuilder::new().set_buckets(buckets)?.build_recorder();
        let handle = recorder.handle();

        Ok(Self {
            recorder,
            handle,
            registered: Mutex::new(HashMap::new()),
        })
    }

    /// Register a metric.
    ///
    /// Fails if the name is already taken or is not a valid Prometheus name.
    pub fn register(
        &self,
        name: &str,
        kind: MetricKind,
        help: &str,
        label_names: &[&str],
    ) -> Result<MetricHandle, MetricsError> {
        if !is_valid_name(name) {
            return Err(MetricsError::InvalidName(name.to_string()));
        }
        if let Some(label) = label_names.iter().find(|l| !is_valid_label(l)) {
            return Err(MetricsError::InvalidLabel {
                metric: name.to_string(),
                label: label.to_string(),
            });
        }

        let mut registered = self
            .registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if registered.contains_key(name) {
            return Err(MetricsError::AlreadyRegistered(name.to_string()));
        }

        let key_name = KeyName::from(name.to_string());
        let help = SharedString::from(help.to_string());
        match kind {
            MetricKind::Counter => self.recorder.describe_counter(key_name, None, help),
            MetricKind::Gauge => self.recorder.describe_gauge(key_name, None, help),
            MetricKind::Histogram => self.recorder.describe_histogram(key_name, None, help),
        }

        let desc = Arc::new(Descriptor {
            name: name.to_string(),
            kind,
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
        });
        registered.insert(name.to_string(), Arc::clone(&desc));

        tracing::debug!(metric = name, kind = %kind, "Metric registered");
        Ok(MetricHandle { desc })
    }

    /// Add `value` to a counter.
    pub fn increment(&self, handle: &MetricHandle, label_values: &[&str], value: u64) {
        if let Some(key) = self.key_for(handle, MetricKind::Counter, label_values) {
            self.recorder.register_counter(&key, &metadata()).increment(value);
        }
    }

    /// Record one histogram observation.
    pub fn observe(&self, handle: &MetricHandle, label_values: &[&str], value: f64) {
        if value.is_nan() || value < 0.0 {
            tracing::warn!(metric = handle.name(), value, "Dropping negative or NaN observation");
            return;
        }
        if let Some(key) = self.key_for(handle, MetricKind::Histogram, label_values) {
            self.recorder.register_histogram(&key, &metadata()).record(value);
        }
    }

    /// Set a gauge to an absolute value.
    pub fn set(&self, handle: &MetricHandle, label_values: &[&str], value: f64) {
        if let Some(key) = self.key_for(handle, MetricKind::Gauge, label_values) {
            self.recorder.register_gauge(&key, &metadata()).set(value);
        }
    }

    /// Move a gauge up or down by `delta`.
    pub fn add(&self, handle: &MetricHandle, label_values: &[&str], delta: f64) {
        if let Some(key) = self.key_for(handle, MetricKind::Gauge, label_values) {
            let gauge = self.recorder.register_gauge(&key, &metadata());
            if delta >= 0.0 {
                gauge.increment(delta);
            } else {
                gauge.decrement(-delta);
            }
        }
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    fn key_for(&self, handle: &MetricHandle, expected: MetricKind, label_values: &[&str]) -> Option<Key> {
        let desc = &handle.desc;
        if desc.kind != expected {
            tracing::warn!(
                metric = %desc.name,
                registered = %desc.kind,
                requested = %expected,
                "Metric kind mismatch, observation dropped"
            );
            return None;
        }
        if desc.label_names.len() != label_values.len() {
            tracing::warn!(
                metric = %desc.name,
                expected = desc.label_names.len(),
                actual = label_values.len(),
                "Label arity mismatch, observation dropped"
            );
            return None;
        }

        let labels: Vec<Label> = desc
            .label_names
            .iter()
            .zip(label_values)
            .map(|(name, value)| Label::new(name.clone(), value.to_string()))
            .collect();
        Some(Key::from_parts(desc.name.clone(), labels))
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    !name.starts_with("__") && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Handles for the service metric set.
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    registry: Arc<MetricsRegistry>,
    pub requests_total: MetricHandle,
    pub request_duration: MetricHandle,
    pub active_connections: MetricHandle,
    pub products: MetricHandle,
    pub storage_errors: MetricHandle,
}

impl ServiceMetrics {
    /// Register the service metric set. Called once at startup.
    pub fn register(registry: Arc<MetricsRegistry>) -> Result<Self, MetricsError> {
        let requests_total = registry.register(
            "http_requests_total",
            MetricKind::Counter,
            "Total number of HTTP requests received",
            &["path", "method", "status"],
        )?;
        let request_duration = registry.register(
            "http_request_duration_seconds",
            MetricKind::Histogram,
            "HTTP request duration in seconds",
            &["path", "method"],
        )?;
        let active_connections = registry.register(
            "http_active_connections",
            MetricKind::Gauge,
            "Number of in-flight HTTP requests",
            &[],
        )?;
        let products = registry.register(
            "products_in_db",
            MetricKind::Gauge,
            "Number of products in the store",
            &[],
        )?;
        let storage_errors = registry.register(
            "sql_errors_total",
            MetricKind::Counter,
            "Total number of storage errors",
            &[],
        )?;

        // Expose the gauges at zero before the first request or refresh.
        registry.set(&active_connections, &[], 0.0);
        registry.set(&products, &[], 0.0);

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            active_connections,
            products,
            storage_errors,
        })
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// Record one completed request.
    pub fn record_request(&self, route: &str, method: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.registry
            .increment(&self.requests_total, &[route, method, &status], 1);
        self.registry
            .observe(&self.request_duration, &[route, method], elapsed.as_secs_f64());
    }

    pub fn connection_opened(&self) {
        self.registry.add(&self.active_connections, &[], 1.0);
    }

    pub fn connection_closed(&self) {
        self.registry.add(&self.active_connections, &[], -1.0);
    }

    pub fn set_products(&self, count: u64) {
        self.registry.set(&self.products, &[], count as f64);
    }

    pub fn storage_error(&self) {
        self.registry.increment(&self.storage_errors, &[], 1);
    }
}
