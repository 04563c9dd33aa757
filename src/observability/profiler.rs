//! Span wrapping for individual operations.
//!
//! `profiled` runs a fallible async operation inside a child span of the
//! given context. The tracer identity is taken from the context (see
//! [`ActiveTracer`]) so the same helper produces storage spans inside a
//! request and application spans elsewhere.

use std::borrow::Cow;
use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use opentelemetry::trace::{FutureExt, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_sdk::trace::SdkTracer;

const FALLBACK_SCOPE: &str = env!("CARGO_PKG_NAME");

/// Attribute carrying the id of the entity an operation acts on.
pub const SUBJECT_ID_ATTRIBUTE: &str = "operation.subject_id";

/// Tracer identity carried inside a [`Context`].
#[derive(Debug, Clone)]
pub struct ActiveTracer(pub SdkTracer);

/// Run `f` inside a span named `operation`.
///
/// `f` receives the span-bearing context; pass it on to nested calls so
/// their spans become children. `subject_id` is recorded when non-zero.
/// An `Err` marks the span with the error text and is returned unchanged.
pub async fn profiled<T, E, F, Fut>(
    cx: &Context,
    operation: impl Into<Cow<'static, str>>,
    subject_id: i64,
    f: F,
) -> Result<T, E>
where
    E: Display,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let operation = operation.into();
    let span_cx = start_span(cx, operation.clone(), subject_id);
    let guard = SpanGuard::new(span_cx.clone());
    let started = Instant::now();

    let result = f(span_cx.clone()).with_context(span_cx).await;

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    match &result {
        Ok(_) => {
            tracing::debug!(operation = %operation, subject_id, elapsed_ms, "Operation completed");
            guard.finish(Status::Ok);
        }
        Err(e) => {
            let message = e.to_string();
            tracing::debug!(operation = %operation, subject_id, elapsed_ms, error = %message, "Operation failed");
            guard.finish(Status::error(message));
        }
    }

    result
}

fn start_span(parent: &Context, name: Cow<'static, str>, subject_id: i64) -> Context {
    let mut attributes = Vec::new();
    if subject_id != 0 {
        attributes.push(KeyValue::new(SUBJECT_ID_ATTRIBUTE, subject_id));
    }

    match parent.get::<ActiveTracer>() {
        Some(ActiveTracer(tracer)) => open(tracer, parent, name, attributes),
        None => open(&global::tracer(FALLBACK_SCOPE), parent, name, attributes),
    }
}

fn open<T>(tracer: &T, parent: &Context, name: Cow<'static, str>, attributes: Vec<KeyValue>) -> Context
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    let span = tracer
        .span_builder(name)
        .with_kind(SpanKind::Internal)
        .with_attributes(attributes)
        .start_with_context(tracer, parent);
    parent.with_span(span)
}

/// Ends the operation span exactly once.
struct SpanGuard {
    cx: Context,
    finished: bool,
}

impl SpanGuard {
    fn new(cx: Context) -> Self {
        Self { cx, finished: false }
    }

    fn finish(mut self, status: Status) {
        let span = self.cx.span();
        span.set_status(status);
        span.end();
        self.finished = true;
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if !self.finished {
            let span = self.cx.span();
            span.set_status(Status::error("operation cancelled"));
            span.end();
        }
    }
}
