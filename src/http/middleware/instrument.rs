//! Per-request instrumentation.
//!
//! # Responsibilities
//! - Open a server span per request, parented on inbound trace headers
//! - Track in-flight requests in `http_active_connections`
//! - Record request count and duration by route template, method and status
//! - Emit one correlated log line per completed request
//!
//! # Design Decisions
//! - The route label is the matched template, never the raw URI
//! - Metrics and span status read the status once, after the handler returns
//! - A dropped request future ends its span as cancelled and records no count
//! - Panics and timeouts are turned into responses below this layer

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, FromRequestParts, MatchedPath, Request, State};
use axum::http::header::USER_AGENT;
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use opentelemetry::trace::{FutureExt, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;

use crate::http::response::ResponseCapture;
use crate::observability::metrics::UNMATCHED_ROUTE;
use crate::observability::{CorrelationContext, Observability};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Wrap every route of `router` with request ids, instrumentation,
/// panic recovery and the request timeout, outermost first.
#[allow(deprecated)]
pub fn instrument<S>(router: Router<S>, obs: Arc<Observability>, request_timeout: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let x_request_id = axum::http::HeaderName::from_static(X_REQUEST_ID);

    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            .layer(PropagateRequestIdLayer::new(x_request_id))
            .layer(middleware::from_fn_with_state(obs, instrument_request))
            .layer(CatchPanicLayer::new())
            .layer(TimeoutLayer::new(request_timeout)),
    )
}

/// Middleware body; see the module docs.
pub async fn instrument_request(
    State(obs): State<Arc<Observability>>,
    mut request: Request,
    next: Next,
) -> Response {
    let guard = RequestGuard::begin(obs, &request);
    let cx = guard.context().clone();
    request.extensions_mut().insert(TraceContext(cx.clone()));

    let response = next.run(request).with_context(cx).await;

    let mut capture = ResponseCapture::new();
    let response = capture.capture(response);
    guard.finish(&capture);
    response
}

/// The request's span context, for handlers.
///
/// Falls back to the current context outside instrumented routes.
#[derive(Debug, Clone)]
pub struct TraceContext(pub Context);

impl<S> FromRequestParts<S> for TraceContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<TraceContext>()
            .cloned()
            .unwrap_or_else(|| TraceContext(Context::current())))
    }
}

/// Everything observed about one request between entry and response.
///
/// Holds one unit of `http_active_connections` for its lifetime.
pub struct RequestGuard {
    obs: Arc<Observability>,
    cx: Context,
    route: String,
    path: String,
    method: String,
    remote_addr: Option<String>,
    user_agent: Option<String>,
    request_id: Option<String>,
    started: Instant,
    finished: bool,
}

impl RequestGuard {
    /// Start observing `request`: open its span and count it as in flight.
    pub fn begin(obs: Arc<Observability>, request: &Request) -> Self {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
        let path = request.uri().path().to_string();
        let method = request.method().as_str().to_string();
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string());
        let user_agent = header_value(request, USER_AGENT.as_str());
        let request_id = header_value(request, X_REQUEST_ID);

        let mut attributes = vec![
            KeyValue::new("http.method", method.clone()),
            KeyValue::new("http.route", route.clone()),
            KeyValue::new("http.target", path.clone()),
        ];
        if let Some(addr) = &remote_addr {
            attributes.push(KeyValue::new("net.sock.peer.addr", addr.clone()));
        }
        if let Some(agent) = &user_agent {
            attributes.push(KeyValue::new("user_agent.original", agent.clone()));
        }

        let parent = obs.extract_context(request.headers());
        let tracer = obs.application_tracer();
        let span = tracer
            .span_builder(format!("{method} {route}"))
            .with_kind(SpanKind::Server)
            .with_attributes(attributes)
            .start_with_context(tracer, &parent);
        let cx = parent.with_span(span);

        obs.metrics().connection_opened();

        Self {
            obs,
            cx,
            route,
            path,
            method,
            remote_addr,
            user_agent,
            request_id,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Context carrying the request span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Record the outcome captured in `capture` and end the span.
    pub fn finish(mut self, capture: &ResponseCapture) {
        let status = capture.final_status();
        let code = status.as_u16();
        let elapsed = self.started.elapsed();

        let span = self.cx.span();
        span.set_attribute(KeyValue::new("http.status_code", i64::from(code)));
        if code >= 400 {
            let description = capture
                .failure()
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string());
            span.set_status(Status::error(description));
        } else {
            span.set_status(Status::Ok);
        }

        self.obs
            .metrics()
            .record_request(&self.route, &self.method, code, elapsed);

        let correlation = CorrelationContext::from_context(&self.cx);
        let (trace_id, span_id) = match &correlation {
            Some(c) => (Some(c.trace_id.as_str()), Some(c.span_id.as_str())),
            None => (None, None),
        };
        {
            let _attached = self.cx.clone().attach();
            tracing::info!(
                component = "http_middleware",
                path = %self.path,
                route = %self.route,
                method = %self.method,
                status_code = code,
                duration_ms = elapsed.as_secs_f64() * 1000.0,
                remote_addr = self.remote_addr.as_deref(),
                user_agent = self.user_agent.as_deref(),
                request_id = self.request_id.as_deref(),
                error = capture.failure(),
                trace_id,
                span_id,
                "HTTP request processed"
            );
        }

        span.end();
        self.finished = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.finished {
            let span = self.cx.span();
            span.set_status(Status::error("request cancelled"));
            span.end();
            tracing::debug!(
                path = %self.path,
                method = %self.method,
                request_id = self.request_id.as_deref(),
                "HTTP request cancelled before completion"
            );
        }
        self.obs.metrics().connection_closed();
    }
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
