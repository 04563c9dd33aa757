//! Distributed tracing backends.
//!
//! # Responsibilities
//! - Build one named tracer provider per service identity
//! - Export spans in batches over OTLP (gRPC or HTTP)
//! - Register the primary provider and the W3C propagators globally
//! - Flush and shut every provider down under a bounded timeout
//!
//! # Design Decisions
//! - Construction order per provider: transport → exporter → resource → provider
//! - Failure policy is configuration, not an implicit default
//! - A degraded provider still issues valid span ids so logs stay correlated
//! - Providers are independent; shutdown runs them concurrently

use std::time::Duration;

use futures_util::future::join_all;
use opentelemetry::global;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{ExporterBuildError, Protocol, WithExportConfig};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, Sampler, SdkTracer, SdkTracerProvider, SpanExporter,
};
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::{task, time};
use url::Url;

use crate::config::{ExportProtocol, FailurePolicy, TracingConfig};

/// Role of the provider that traces inbound HTTP requests.
pub const APPLICATION: &str = "application";

/// Role of the provider that traces storage access.
pub const STORAGE: &str = "storage";

/// Semantic-convention schema the resource attributes follow.
pub const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.17.0";

const INSTRUMENTATION_SCOPE: &str = env!("CARGO_PKG_NAME");

/// Errors raised while wiring or tearing down tracing.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid collector endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("collector at {endpoint} unreachable for service `{service}`: {reason}")]
    CollectorUnreachable {
        service: String,
        endpoint: String,
        reason: String,
    },

    #[error("failed to build span exporter for service `{service}`: {source}")]
    Exporter {
        service: String,
        #[source]
        source: ExporterBuildError,
    },

    #[error("tracer provider role `{0}` registered twice")]
    DuplicateRole(String),

    #[error("no tracer provider registered for role `{0}`")]
    UnknownRole(String),

    #[error("tracer providers failed to shut down: {}", .0.join("; "))]
    Shutdown(Vec<String>),
}

struct NamedProvider {
    role: String,
    service_name: String,
    provider: SdkTracerProvider,
    degraded: bool,
}

/// Owns every tracer provider of the process.
pub struct TracerProviderManager {
    providers: Vec<NamedProvider>,
    primary: usize,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for TracerProviderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let roles: Vec<&str> = self.providers.iter().map(|p| p.role.as_str()).collect();
        f.debug_struct("TracerProviderManager")
            .field("roles", &roles)
            .field("primary", &self.providers[self.primary].role)
            .finish()
    }
}

impl TracerProviderManager {
    pub fn builder(config: TracingConfig) -> TracerProviderBuilder {
        TracerProviderBuilder {
            config,
            sampler: Sampler::AlwaysOn,
            providers: Vec::new(),
        }
    }

    /// Build the application and storage providers from configuration.
    pub async fn from_config(config: &TracingConfig) -> Result<Self, TelemetryError> {
        Self::builder(config.clone())
            .with_otlp(APPLICATION, &config.application_service)
            .await?
            .with_otlp(STORAGE, &config.storage_service)
            .await?
            .build(APPLICATION)
    }

    pub fn provider(&self, role: &str) -> Option<&SdkTracerProvider> {
        self.find(role).map(|p| &p.provider)
    }

    pub fn primary(&self) -> &SdkTracerProvider {
        &self.providers[self.primary].provider
    }

    /// Tracer for the given role.
    pub fn tracer(&self, role: &str) -> Result<SdkTracer, TelemetryError> {
        self.find(role)
            .map(|p| p.provider.tracer(INSTRUMENTATION_SCOPE))
            .ok_or_else(|| TelemetryError::UnknownRole(role.to_string()))
    }

    pub fn service_name(&self, role: &str) -> Option<&str> {
        self.find(role).map(|p| p.service_name.as_str())
    }

    /// True if any provider was built without an exporter.
    pub fn is_degraded(&self) -> bool {
        self.providers.iter().any(|p| p.degraded)
    }

    pub fn degraded_roles(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|p| p.degraded)
            .map(|p| p.role.as_str())
            .collect()
    }

    /// Register the primary provider and the composite propagator process-wide.
    pub fn install_global(&self) {
        global::set_tracer_provider(self.primary().clone());
        global::set_text_map_propagator(composite_propagator());

        let primary = &self.providers[self.primary];
        tracing::info!(
            role = %primary.role,
            service = %primary.service_name,
            "Tracer provider registered as global"
        );
    }

    /// Export everything buffered so far. Blocks until the exporters answer.
    pub fn force_flush(&self) {
        for named in &self.providers {
            if let Err(e) = named.provider.force_flush() {
                tracing::warn!(role = %named.role, error = %e, "Failed to flush spans");
            }
        }
    }

    /// Flush and close every provider concurrently.
    ///
    /// Each provider gets the configured timeout. Failures are logged and
    /// reported together once all providers have finished.
    pub async fn shutdown(self) -> Result<(), TelemetryError> {
        let timeout = self.shutdown_timeout;

        let pending = self.providers.into_iter().map(|named| async move {
            let NamedProvider {
                role,
                service_name,
                provider,
                ..
            } = named;
            tracing::info!(role = %role, service = %service_name, "Shutting down tracer provider");

            match time::timeout(timeout, task::spawn_blocking(move || provider.shutdown())).await {
                Ok(Ok(Ok(()))) => {
                    tracing::info!(role = %role, service = %service_name, "Tracer provider shut down");
                    None
                }
                Ok(Ok(Err(e))) => {
                    tracing::error!(role = %role, error = %e, "Tracer provider shutdown failed");
                    Some(format!("{role}: {e}"))
                }
                Ok(Err(e)) => {
                    tracing::error!(role = %role, error = %e, "Tracer provider shutdown task failed");
                    Some(format!("{role}: {e}"))
                }
                Err(_) => {
                    tracing::error!(role = %role, timeout = ?timeout, "Tracer provider shutdown timed out");
                    Some(format!("{role}: timed out after {timeout:?}"))
                }
            }
        });

        let failures: Vec<String> = join_all(pending).await.into_iter().flatten().collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TelemetryError::Shutdown(failures))
        }
    }

    fn find(&self, role: &str) -> Option<&NamedProvider> {
        self.providers.iter().find(|p| p.role == role)
    }
}

/// Incremental construction of a [`TracerProviderManager`].
pub struct TracerProviderBuilder {
    config: TracingConfig,
    sampler: Sampler,
    providers: Vec<NamedProvider>,
}

impl TracerProviderBuilder {
    /// Sampler for providers added after this call. Defaults to always-on.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Add a provider exporting over OTLP to the configured collector.
    ///
    /// Under [`FailurePolicy::Fatal`] any construction error is returned.
    /// Under [`FailurePolicy::Degraded`] the provider is built without an
    /// exporter and a warning is logged.
    pub async fn with_otlp(mut self, role: &str, service_name: &str) -> Result<Self, TelemetryError> {
        self.ensure_unique(role)?;

        let (provider, degraded) = match self.connect(service_name).await {
            Ok(exporter) => (self.batched_provider(exporter, service_name), false),
            Err(err) => match self.config.failure_policy {
                FailurePolicy::Fatal => return Err(err),
                FailurePolicy::Degraded => {
                    tracing::warn!(
                        role,
                        service = service_name,
                        error = %err,
                        "Tracing degraded: spans for this service will not be exported"
                    );
                    let provider = SdkTracerProvider::builder()
                        .with_sampler(self.sampler.clone())
                        .with_resource(self.resource(service_name))
                        .build();
                    (provider, true)
                }
            },
        };

        tracing::info!(role, service = service_name, degraded, "Tracer provider created");
        self.providers.push(NamedProvider {
            role: role.to_string(),
            service_name: service_name.to_string(),
            provider,
            degraded,
        });
        Ok(self)
    }

    /// Add a provider around a caller-supplied exporter.
    pub fn with_exporter<E>(mut self, role: &str, service_name: &str, exporter: E) -> Result<Self, TelemetryError>
    where
        E: SpanExporter + 'static,
    {
        self.ensure_unique(role)?;
        let provider = self.batched_provider(exporter, service_name);
        self.providers.push(NamedProvider {
            role: role.to_string(),
            service_name: service_name.to_string(),
            provider,
            degraded: false,
        });
        Ok(self)
    }

    /// Finish construction; `primary_role` becomes the global tracer source.
    pub fn build(self, primary_role: &str) -> Result<TracerProviderManager, TelemetryError> {
        let primary = self
            .providers
            .iter()
            .position(|p| p.role == primary_role)
            .ok_or_else(|| TelemetryError::UnknownRole(primary_role.to_string()))?;

        Ok(TracerProviderManager {
            providers: self.providers,
            primary,
            shutdown_timeout: Duration::from_secs(self.config.shutdown_timeout_secs),
        })
    }

    fn ensure_unique(&self, role: &str) -> Result<(), TelemetryError> {
        if self.providers.iter().any(|p| p.role == role) {
            return Err(TelemetryError::DuplicateRole(role.to_string()));
        }
        Ok(())
    }

    async fn connect(&self, service_name: &str) -> Result<opentelemetry_otlp::SpanExporter, TelemetryError> {
        let url = collector_url(&self.config.endpoint)?;
        let timeout = Duration::from_secs(self.config.export_timeout_secs);

        if self.config.probe_collector {
            probe(&url, timeout)
                .await
                .map_err(|reason| TelemetryError::CollectorUnreachable {
                    service: service_name.to_string(),
                    endpoint: url.to_string(),
                    reason,
                })?;
            tracing::debug!(endpoint = %url, service = service_name, "Collector reachable");
        }

        let exporter = match self.config.protocol {
            ExportProtocol::Grpc => opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(url.as_str().trim_end_matches('/'))
                .with_timeout(timeout)
                .build(),
            ExportProtocol::Http => opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(http_traces_url(&url))
                .with_protocol(Protocol::HttpBinary)
                .with_timeout(timeout)
                .build(),
        };

        exporter.map_err(|source| TelemetryError::Exporter {
            service: service_name.to_string(),
            source,
        })
    }

    fn batched_provider<E>(&self, exporter: E, service_name: &str) -> SdkTracerProvider
    where
        E: SpanExporter + 'static,
    {
        let batch = BatchConfigBuilder::default()
            .with_scheduled_delay(Duration::from_millis(self.config.batch_interval_ms))
            .build();
        let processor = BatchSpanProcessor::builder(exporter)
            .with_batch_config(batch)
            .build();

        SdkTracerProvider::builder()
            .with_span_processor(processor)
            .with_sampler(self.sampler.clone())
            .with_resource(self.resource(service_name))
            .build()
    }

    fn resource(&self, service_name: &str) -> Resource {
        let mut attributes = vec![KeyValue::new("environment", self.config.environment.clone())];
        attributes.extend(
            self.config
                .resource_attributes
                .iter()
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
        );

        Resource::builder()
            .with_service_name(service_name.to_string())
            .with_schema_url(attributes, SCHEMA_URL)
            .build()
    }
}

/// W3C trace-context plus baggage.
pub fn composite_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Parse a collector endpoint, defaulting the scheme to `http`.
pub fn collector_url(endpoint: &str) -> Result<Url, TelemetryError> {
    let endpoint = endpoint.trim();
    let invalid = |reason: String| TelemetryError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };

    if endpoint.is_empty() {
        return Err(invalid("endpoint is empty".to_string()));
    }

    let candidate = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    };

    let url = Url::parse(&candidate).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

fn http_traces_url(url: &Url) -> String {
    if url.path() == "/" || url.path().is_empty() {
        format!("{}/v1/traces", url.as_str().trim_end_matches('/'))
    } else {
        url.to_string()
    }
}

async fn probe(url: &Url, timeout: Duration) -> Result<(), String> {
    let host = url.host_str().ok_or_else(|| "missing host".to_string())?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| "missing port".to_string())?;

    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("connect timed out after {timeout:?}")),
    }
}
