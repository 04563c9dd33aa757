//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use inventory_telemetry::config::TracingConfig;
use inventory_telemetry::inventory::{Product, ProductCounter, ProductInput, ProductStore, StoreError};
use inventory_telemetry::observability::{
    MetricsRegistry, Observability, ServiceMetrics, TracerProviderManager, APPLICATION, STORAGE,
};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{InMemorySpanExporter, Sampler, SpanData, SpanExporter};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

// ---------------------------------------------------------------------------
// Observability fixture
// ---------------------------------------------------------------------------

/// Observability wired to in-memory span exporters.
pub struct TestTelemetry {
    pub obs: Arc<Observability>,
    pub tracers: TracerProviderManager,
    pub application_spans: InMemorySpanExporter,
    pub storage_spans: InMemorySpanExporter,
}

impl TestTelemetry {
    pub fn new() -> Self {
        Self::with_sampler(Sampler::AlwaysOn)
    }

    pub fn with_sampler(sampler: Sampler) -> Self {
        let application_spans = InMemorySpanExporter::default();
        let storage_spans = InMemorySpanExporter::default();
        let tracers = TracerProviderManager::builder(TracingConfig::default())
            .with_sampler(sampler)
            .with_exporter(APPLICATION, "inventory-app", application_spans.clone())
            .unwrap()
            .with_exporter(STORAGE, "inventory-storage", storage_spans.clone())
            .unwrap()
            .build(APPLICATION)
            .unwrap();

        let registry = Arc::new(MetricsRegistry::new().unwrap());
        let metrics = ServiceMetrics::register(registry).unwrap();
        let obs = Arc::new(Observability::new(metrics, &tracers).unwrap());

        Self {
            obs,
            tracers,
            application_spans,
            storage_spans,
        }
    }

    /// Finished request spans.
    pub fn request_spans(&self) -> Vec<SpanData> {
        self.tracers.force_flush();
        self.application_spans.get_finished_spans().unwrap()
    }

    /// Finished storage spans.
    pub fn storage_spans(&self) -> Vec<SpanData> {
        self.tracers.force_flush();
        self.storage_spans.get_finished_spans().unwrap()
    }

    pub fn metrics(&self) -> String {
        self.obs.registry().render()
    }
}

pub fn attribute(span: &SpanData, key: &str) -> Option<opentelemetry::Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

/// Span exporter that keeps every exported batch, including across shutdown.
#[derive(Debug, Clone, Default)]
pub struct RecordingExporter {
    batches: Arc<Mutex<Vec<Vec<SpanData>>>>,
    shut_down: Arc<Mutex<bool>>,
}

impl RecordingExporter {
    pub fn spans(&self) -> Vec<SpanData> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn batches(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shut_down.lock().unwrap()
    }
}

impl SpanExporter for RecordingExporter {
    async fn export(&self, batch: Vec<SpanData>) -> OTelSdkResult {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn shutdown_with_timeout(&mut self, _timeout: Duration) -> OTelSdkResult {
        *self.shut_down.lock().unwrap() = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Prometheus exposition parsing
// ---------------------------------------------------------------------------

/// Value of the first series named `name` whose labels include `labels`.
pub fn sample(text: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    series(text)
        .find(|(n, l, _)| n == name && labels_match(l, labels))
        .map(|(_, _, v)| v)
}

/// Sum of every series named `name` whose labels include `labels`.
pub fn sum(text: &str, name: &str, labels: &[(&str, &str)]) -> f64 {
    series(text)
        .filter(|(n, l, _)| n == name && labels_match(l, labels))
        .map(|(_, _, v)| v)
        .sum()
}

fn series(text: &str) -> impl Iterator<Item = (String, Vec<(String, String)>, f64)> + '_ {
    text.lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .filter_map(|line| {
            let (series, value) = line.rsplit_once(' ')?;
            let value = parse_value(value)?;
            match series.find('{') {
                Some(open) => {
                    let close = series.rfind('}')?;
                    Some((series[..open].to_string(), parse_labels(&series[open + 1..close]), value))
                }
                None => Some((series.to_string(), Vec::new(), value)),
            }
        })
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn parse_labels(raw: &str) -> Vec<(String, String)> {
    let mut labels = Vec::new();
    let mut rest = raw;
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim_start_matches(',').trim().to_string();
        let after = &rest[eq + 2..];
        let mut value = String::new();
        let mut chars = after.char_indices();
        let mut end = after.len();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => {
                    end = i + 1;
                    break;
                }
                other => value.push(other),
            }
        }
        labels.push((key, value));
        rest = &after[end..];
    }
    labels
}

fn labels_match(actual: &[(String, String)], wanted: &[(&str, &str)]) -> bool {
    wanted.iter().all(|(key, value)| {
        actual.iter().any(|(k, v)| {
            k == key
                && (v == value
                    || (*key == "le" && parse_value(v).is_some() && parse_value(v) == parse_value(value)))
        })
    })
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl LogEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Collects every event of the thread it is installed on.
#[derive(Clone, Default)]
pub struct LogCapture {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogCapture {
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::set_default(subscriber)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn with_message(&self, message: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.message == message)
            .collect()
    }

    /// Events of `level` emitted by this crate.
    pub fn at_level(&self, level: Level) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level == level && e.target.starts_with("inventory_telemetry"))
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.entries.lock().unwrap().push(LogEntry {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: HashMap<String, String>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.to_string());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

// ---------------------------------------------------------------------------
// Store doubles
// ---------------------------------------------------------------------------

/// Store whose every call fails with `Unavailable`.
pub struct UnavailableStore;

fn unavailable<'a, T: Send + 'a>() -> BoxFuture<'a, Result<T, StoreError>> {
    Box::pin(future::ready(Err(StoreError::Unavailable("connection refused".to_string()))))
}

impl ProductCounter for UnavailableStore {
    fn count(&self) -> BoxFuture<'_, Result<u64, StoreError>> {
        unavailable()
    }
}

impl ProductStore for UnavailableStore {
    fn list(&self) -> BoxFuture<'_, Result<Vec<Product>, StoreError>> {
        unavailable()
    }

    fn get(&self, _id: i64) -> BoxFuture<'_, Result<Product, StoreError>> {
        unavailable()
    }

    fn create(&self, _input: ProductInput) -> BoxFuture<'_, Result<Product, StoreError>> {
        unavailable()
    }

    fn update(&self, _id: i64, _input: ProductInput) -> BoxFuture<'_, Result<Product, StoreError>> {
        unavailable()
    }

    fn delete(&self, _id: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        unavailable()
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        unavailable()
    }
}

/// Counter answering from a script; repeats the last answer when exhausted.
pub struct ScriptedCounter {
    answers: Mutex<VecDeque<Result<u64, StoreError>>>,
    last: Mutex<Option<Result<u64, StoreError>>>,
    delay: Duration,
    calls: Mutex<usize>,
}

impl ScriptedCounter {
    pub fn new(answers: impl IntoIterator<Item = Result<u64, StoreError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            last: Mutex::new(None),
            delay: Duration::ZERO,
            calls: Mutex::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl ProductCounter for ScriptedCounter {
    fn count(&self) -> BoxFuture<'_, Result<u64, StoreError>> {
        *self.calls.lock().unwrap() += 1;
        let answer = {
            let mut answers = self.answers.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            match answers.pop_front() {
                Some(answer) => {
                    *last = Some(answer.clone());
                    answer
                }
                None => last.clone().unwrap_or(Ok(0)),
            }
        };
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            answer
        })
    }
}
