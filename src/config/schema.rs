//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Root configuration for the inventory service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listener configuration for the inventory API.
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Logging and metrics exposition settings.
    pub observability: ObservabilityConfig,

    /// Span export settings.
    pub tracing: TracingConfig,

    /// Continuous profiler settings.
    pub profiling: ProfilingConfig,

    /// Background product-count refresh.
    pub refresher: RefresherConfig,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:10000").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:10000".to_string(),
        }
    }
}

/// Timeout configuration for request handling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Mirror log events onto the current span as span events.
    pub span_events: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            span_events: true,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:2113".to_string(),
        }
    }
}

/// OTLP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportProtocol {
    Grpc,
    Http,
}

/// What to do when a tracer provider cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Abort startup.
    Fatal,
    /// Keep running without span export for that provider.
    Degraded,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => f.write_str("fatal"),
            Self::Degraded => f.write_str("degraded"),
        }
    }
}

/// Span export configuration shared by every tracer provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Collector endpoint; `http://` is assumed when no scheme is given.
    pub endpoint: String,

    pub protocol: ExportProtocol,

    /// Deployment environment recorded on every resource.
    pub environment: String,

    /// Service name of the request-handling provider.
    pub application_service: String,

    /// Service name of the storage-access provider.
    pub storage_service: String,

    /// Extra resource attributes merged into both providers.
    pub resource_attributes: BTreeMap<String, String>,

    /// Batch span processor flush interval in milliseconds.
    pub batch_interval_ms: u64,

    /// Exporter and collector probe timeout in seconds.
    pub export_timeout_secs: u64,

    /// Per-provider shutdown timeout in seconds.
    pub shutdown_timeout_secs: u64,

    /// Check TCP reachability of the collector before building exporters.
    pub probe_collector: bool,

    pub failure_policy: FailurePolicy,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            endpoint: "otel-collector:4317".to_string(),
            protocol: ExportProtocol::Grpc,
            environment: "local".to_string(),
            application_service: "inventory-app".to_string(),
            storage_service: "inventory-storage".to_string(),
            resource_attributes: BTreeMap::new(),
            batch_interval_ms: 5_000,
            export_timeout_secs: 10,
            shutdown_timeout_secs: 5,
            probe_collector: true,
            failure_policy: FailurePolicy::Fatal,
        }
    }
}

/// Continuous profiler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProfilingConfig {
    pub enabled: bool,

    /// Profiling backend base URL.
    pub server_url: String,

    /// Application name the samples are filed under.
    pub application_name: String,

    pub version: String,

    /// Extra tags attached to every upload.
    pub tags: BTreeMap<String, String>,

    pub sample_interval_ms: u64,

    pub upload_interval_secs: u64,

    /// HTTP timeout for a single upload in seconds.
    pub upload_timeout_secs: u64,

    /// Profile types to collect (cpu, alloc_objects, alloc_space,
    /// inuse_objects, inuse_space, workers).
    pub profile_types: Vec<String>,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_url: "http://pyroscope:4040".to_string(),
            application_name: "inventory-app".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tags: BTreeMap::new(),
            sample_interval_ms: 1_000,
            upload_interval_secs: 15,
            upload_timeout_secs: 5,
            profile_types: [
                "cpu",
                "alloc_objects",
                "alloc_space",
                "inuse_objects",
                "inuse_space",
                "workers",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Background product-count refresher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefresherConfig {
    pub enabled: bool,

    /// Seconds between refreshes.
    pub interval_secs: u64,

    /// Upper bound for a single count query in seconds.
    pub timeout_secs: u64,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            timeout_secs: 3,
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for in-flight requests and background tasks to finish.
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 10 }
    }
}
