//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Mirror log events onto the current OpenTelemetry span
//! - Derive the trace/span correlation pair for log lines
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - Log level configurable via config and environment (`RUST_LOG` wins)
//! - Correlation ids are attached only for valid, sampled span contexts

use std::fmt;

use opentelemetry::trace::TraceContextExt;
use opentelemetry::KeyValue;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{self, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt as ts_fmt, EnvFilter, Layer};

use crate::config::{LogFormat, ObservabilityConfig};

/// Install the process-wide subscriber.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (json, pretty) = match config.log_format {
        LogFormat::Json => (
            Some(
                ts_fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(false),
            ),
            None,
        ),
        LogFormat::Pretty => (None, Some(ts_fmt::layer().pretty())),
    };

    let span_events = config.span_events.then(SpanEventLayer::default);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .with(span_events)
        .try_init()
}

/// The (trace_id, span_id) pair attached to correlated log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    pub trace_id: String,
    pub span_id: String,
}

impl CorrelationContext {
    /// `None` unless the context's span is valid and sampled.
    pub fn from_context(cx: &opentelemetry::Context) -> Option<Self> {
        let span = cx.span();
        let sc = span.span_context();
        if !sc.is_valid() || !sc.is_sampled() {
            return None;
        }
        Some(Self {
            trace_id: sc.trace_id().to_string(),
            span_id: sc.span_id().to_string(),
        })
    }
}

/// Records every log event as an event on the current OpenTelemetry span.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpanEventLayer;

impl<S: Subscriber> Layer<S> for SpanEventLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: layer::Context<'_, S>) {
        let cx = opentelemetry::Context::current();
        if !cx.has_active_span() {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        let meta = event.metadata();
        let mut attributes = Vec::with_capacity(fields.attributes.len() + 2);
        attributes.push(KeyValue::new("level", meta.level().as_str()));
        attributes.push(KeyValue::new("target", meta.target()));
        attributes.extend(fields.attributes);

        let name = fields.message.unwrap_or_else(|| meta.name().to_string());
        cx.span().add_event(name, attributes);
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    attributes: Vec<KeyValue>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.attributes.push(KeyValue::new(field.name(), value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.attributes.push(KeyValue::new(field.name(), value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.attributes.push(KeyValue::new(field.name(), i64::try_from(value).unwrap_or(i64::MAX)));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.attributes.push(KeyValue::new(field.name(), value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.attributes.push(KeyValue::new(field.name(), value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.attributes.push(KeyValue::new(field.name(), format!("{value:?}")));
        }
    }
}
