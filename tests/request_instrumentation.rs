//! End-to-end behaviour of the request instrumentation layer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::future::join_all;
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::Value;
use opentelemetry_sdk::trace::Sampler;
use tokio::sync::Notify;
use tower::ServiceExt;

use common::{attribute, sample, sum, LogCapture, TestTelemetry, UnavailableStore};
use inventory_telemetry::http::middleware::RequestGuard;
use inventory_telemetry::http::{build_router, instrument, AppState, ResponseCapture, X_REQUEST_ID};
use inventory_telemetry::inventory::{InMemoryStore, Product, ProductInput, ProductStore};
use inventory_telemetry::observability::profiler::SUBJECT_ID_ATTRIBUTE;

const TIMEOUT: Duration = Duration::from_secs(5);

fn stocked_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::with_products([
        ProductInput {
            name: "widget".to_string(),
            quantity: 4,
            price: 2.5,
        },
        ProductInput {
            name: "gadget".to_string(),
            quantity: 1,
            price: 10.0,
        },
    ]))
}

fn inventory_router(telemetry: &TestTelemetry, store: Arc<dyn ProductStore>) -> Router {
    build_router(
        AppState {
            obs: telemetry.obs.clone(),
            store,
        },
        TIMEOUT,
    )
}

fn get_request(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn listing_products_produces_span_metrics_and_one_log_line() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let telemetry = TestTelemetry::new();
    let router = inventory_router(&telemetry, stocked_store());

    let request = Request::get("/products")
        .header("user-agent", "inventory-tests")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let request_id = response
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("response carries a request id");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let products: Vec<Product> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(products.len(), 2);

    let spans = telemetry.request_spans();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.name, "GET /products");
    assert_eq!(span.span_kind, SpanKind::Server);
    assert_eq!(span.status, Status::Ok);
    assert_eq!(attribute(span, "http.status_code"), Some(Value::I64(200)));
    assert_eq!(attribute(span, "http.route"), Some(Value::from("/products")));

    let text = telemetry.metrics();
    assert_eq!(
        sample(&text, "http_requests_total", &[("path", "/products"), ("method", "GET"), ("status", "200")]),
        Some(1.0)
    );
    assert_eq!(sum(&text, "http_requests_total", &[]), 1.0);
    assert_eq!(
        sample(&text, "http_request_duration_seconds_count", &[("path", "/products"), ("method", "GET")]),
        Some(1.0)
    );

    let lines = logs.with_message("HTTP request processed");
    assert_eq!(lines.len(), 1);
    let line = &lines[0];
    assert_eq!(line.field("component"), Some("http_middleware"));
    assert_eq!(line.field("path"), Some("/products"));
    assert_eq!(line.field("method"), Some("GET"));
    assert_eq!(line.field("status_code"), Some("200"));
    assert_eq!(line.field("user_agent"), Some("inventory-tests"));
    assert_eq!(line.field("request_id"), Some(request_id.as_str()));
    let trace_id = span.span_context.trace_id().to_string();
    let span_id = span.span_context.span_id().to_string();
    assert_eq!(line.field("trace_id"), Some(trace_id.as_str()));
    assert_eq!(line.field("span_id"), Some(span_id.as_str()));
    assert!(line.field("error").is_none());
}

#[tokio::test]
async fn missing_product_is_labelled_by_route_template() {
    let telemetry = TestTelemetry::new();
    let router = inventory_router(&telemetry, stocked_store());

    let response = send(&router, get_request("/product/999")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "error": "product with ID 999 not found" })
    );

    let spans = telemetry.request_spans();
    assert_eq!(spans[0].name, "GET /product/{id}");
    assert_eq!(spans[0].status, Status::error("product with ID 999 not found"));

    let text = telemetry.metrics();
    assert_eq!(
        sample(&text, "http_requests_total", &[("path", "/product/{id}"), ("method", "GET"), ("status", "404")]),
        Some(1.0)
    );
    assert_eq!(sum(&text, "http_requests_total", &[("path", "/product/999")]), 0.0);
    assert_eq!(sum(&text, "sql_errors_total", &[]), 0.0);
}

#[tokio::test]
async fn unknown_routes_share_one_label() {
    let telemetry = TestTelemetry::new();
    let router = inventory_router(&telemetry, stocked_store());

    for uri in ["/nope", "/products/extra/segments", "/admin"] {
        let response = send(&router, get_request(uri)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    let text = telemetry.metrics();
    assert_eq!(
        sample(&text, "http_requests_total", &[("path", "unmatched"), ("method", "GET"), ("status", "404")]),
        Some(3.0)
    );
    assert!(telemetry
        .request_spans()
        .iter()
        .all(|span| span.name == "GET unmatched"));
}

#[tokio::test]
async fn duration_lands_in_the_matching_bucket() {
    let telemetry = TestTelemetry::new();
    let slow = Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "done"
        }),
    );
    let router = instrument(slow, telemetry.obs.clone(), TIMEOUT);

    let response = send(&router, get_request("/slow")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let text = telemetry.metrics();
    let bucket = |le: &str| {
        sample(
            &text,
            "http_request_duration_seconds_bucket",
            &[("path", "/slow"), ("method", "GET"), ("le", le)],
        )
    };
    assert_eq!(bucket("0.025"), Some(0.0));
    assert_eq!(bucket("+Inf"), Some(1.0));
    let total = sample(&text, "http_request_duration_seconds_sum", &[("path", "/slow")]).unwrap();
    assert!(total >= 0.05, "observed {total}s");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_each_counted() {
    let telemetry = TestTelemetry::new();
    let router = inventory_router(&telemetry, stocked_store());

    let responses = join_all((0..64).map(|_| send(&router, get_request("/products")))).await;
    assert!(responses.iter().all(|r| r.status() == StatusCode::OK));

    let text = telemetry.metrics();
    assert_eq!(
        sample(&text, "http_requests_total", &[("path", "/products"), ("status", "200")]),
        Some(64.0)
    );
    assert_eq!(sample(&text, "http_active_connections", &[]), Some(0.0));
    assert_eq!(telemetry.request_spans().len(), 64);
}

#[tokio::test]
async fn storage_span_is_a_child_of_the_request_span() {
    let telemetry = TestTelemetry::new();
    let router = inventory_router(&telemetry, stocked_store());

    let response = send(&router, get_request("/product/2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["name"], "gadget");

    let request = telemetry.request_spans().remove(0);
    let storage = telemetry.storage_spans();
    assert_eq!(storage.len(), 1);
    let child = &storage[0];

    assert_eq!(child.name, "get_product");
    assert_eq!(child.span_kind, SpanKind::Internal);
    assert_eq!(child.status, Status::Ok);
    assert_eq!(child.span_context.trace_id(), request.span_context.trace_id());
    assert_eq!(child.parent_span_id, request.span_context.span_id());
    assert_eq!(attribute(child, SUBJECT_ID_ATTRIBUTE), Some(Value::I64(2)));
}

#[tokio::test]
async fn storage_failure_is_a_500_with_a_sanitized_body() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let telemetry = TestTelemetry::new();
    let router = inventory_router(&telemetry, Arc::new(UnavailableStore));

    let response = send(&router, get_request("/products")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "error": "failed to retrieve products" })
    );

    let detail = "failed to retrieve products: storage unavailable: connection refused";
    let spans = telemetry.request_spans();
    assert_eq!(spans[0].status, Status::error(detail));

    let storage = telemetry.storage_spans();
    assert_eq!(storage[0].status, Status::error("storage unavailable: connection refused"));

    let text = telemetry.metrics();
    assert_eq!(sample(&text, "sql_errors_total", &[]), Some(1.0));
    assert_eq!(
        sample(&text, "http_requests_total", &[("path", "/products"), ("status", "500")]),
        Some(1.0)
    );

    let lines = logs.with_message("HTTP request processed");
    assert_eq!(lines[0].field("status_code"), Some("500"));
    assert_eq!(lines[0].field("error"), Some(detail));
}

#[tokio::test]
async fn inbound_traceparent_is_continued() {
    let telemetry = TestTelemetry::new();
    let router = inventory_router(&telemetry, stocked_store());

    let request = Request::get("/products")
        .header("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        .body(Body::empty())
        .unwrap();
    send(&router, request).await;

    let span = telemetry.request_spans().remove(0);
    assert_eq!(
        span.span_context.trace_id().to_string(),
        "4bf92f3577b34da6a3ce929d0e0e4736"
    );
    assert_eq!(span.parent_span_id.to_string(), "00f067aa0ba902b7");
}

async fn exploding_handler() -> &'static str {
    panic!("handler exploded")
}

#[tokio::test]
async fn panicking_handler_is_recorded_as_500() {
    let telemetry = TestTelemetry::new();
    let router = instrument(
        Router::new().route("/explode", get(exploding_handler)),
        telemetry.obs.clone(),
        TIMEOUT,
    );

    let response = send(&router, get_request("/explode")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let text = telemetry.metrics();
    assert_eq!(
        sample(&text, "http_requests_total", &[("path", "/explode"), ("status", "500")]),
        Some(1.0)
    );
    assert_eq!(sample(&text, "http_active_connections", &[]), Some(0.0));
    assert!(matches!(telemetry.request_spans()[0].status, Status::Error { .. }));
}

#[tokio::test]
async fn slow_handler_times_out_with_408() {
    let telemetry = TestTelemetry::new();
    let router = instrument(
        Router::new().route(
            "/stuck",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ),
        telemetry.obs.clone(),
        Duration::from_millis(20),
    );

    let response = send(&router, get_request("/stuck")).await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

    let text = telemetry.metrics();
    assert_eq!(
        sample(&text, "http_requests_total", &[("path", "/stuck"), ("status", "408")]),
        Some(1.0)
    );
}

#[tokio::test]
async fn active_connections_track_in_flight_requests() {
    let telemetry = TestTelemetry::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let handler = {
        let entered = entered.clone();
        let release = release.clone();
        move || {
            let entered = entered.clone();
            let release = release.clone();
            async move {
                entered.notify_one();
                release.notified().await;
                "released"
            }
        }
    };
    let router = instrument(
        Router::new().route("/held", get(handler)),
        telemetry.obs.clone(),
        TIMEOUT,
    );

    let in_flight = {
        let router = router.clone();
        tokio::spawn(async move { router.oneshot(get_request("/held")).await.unwrap() })
    };

    entered.notified().await;
    assert_eq!(sample(&telemetry.metrics(), "http_active_connections", &[]), Some(1.0));

    release.notify_one();
    let response = in_flight.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sample(&telemetry.metrics(), "http_active_connections", &[]), Some(0.0));
}

#[tokio::test]
async fn dropped_request_is_not_counted() {
    let telemetry = TestTelemetry::new();
    let router = instrument(
        Router::new().route("/forever", get(|| futures_util::future::pending::<&'static str>())),
        telemetry.obs.clone(),
        TIMEOUT,
    );

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        router.clone().oneshot(get_request("/forever")),
    )
    .await;
    assert!(outcome.is_err(), "request should still be pending");

    let text = telemetry.metrics();
    assert_eq!(sum(&text, "http_requests_total", &[]), 0.0);
    assert_eq!(sample(&text, "http_active_connections", &[]), Some(0.0));

    let spans = telemetry.request_spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, Status::error("request cancelled"));
}

#[tokio::test]
async fn supplied_request_id_is_kept_and_logged() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let telemetry = TestTelemetry::new();
    let router = inventory_router(&telemetry, stocked_store());

    let request = Request::get("/products")
        .header(X_REQUEST_ID, "req-from-edge-42")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;

    assert_eq!(response.headers()[X_REQUEST_ID], "req-from-edge-42");
    let lines = logs.with_message("HTTP request processed");
    assert_eq!(lines[0].field("request_id"), Some("req-from-edge-42"));
}

#[tokio::test]
async fn first_recorded_status_wins() {
    let telemetry = TestTelemetry::new();
    let request = get_request("/product/7");

    let guard = RequestGuard::begin(telemetry.obs.clone(), &request);
    let mut capture = ResponseCapture::new();
    assert!(capture.record(StatusCode::NOT_FOUND));
    assert!(!capture.record(StatusCode::OK));
    guard.finish(&capture);

    let text = telemetry.metrics();
    assert_eq!(
        sample(&text, "http_requests_total", &[("path", "unmatched"), ("status", "404")]),
        Some(1.0)
    );
    assert_eq!(sum(&text, "http_requests_total", &[("status", "200")]), 0.0);

    let span = telemetry.request_spans().remove(0);
    assert_eq!(attribute(&span, "http.status_code"), Some(Value::I64(404)));
    assert!(matches!(span.status, Status::Error { .. }));
}

#[tokio::test]
async fn unsampled_request_logs_without_trace_ids() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let telemetry = TestTelemetry::with_sampler(Sampler::AlwaysOff);
    let router = inventory_router(&telemetry, stocked_store());

    let response = send(&router, get_request("/products")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(telemetry.request_spans().is_empty());

    let lines = logs.with_message("HTTP request processed");
    assert_eq!(lines.len(), 1);
    let line = &lines[0];
    assert_eq!(line.field("status_code"), Some("200"));
    assert!(line.field("request_id").is_some());
    assert!(line.field("trace_id").is_none());
    assert!(line.field("span_id").is_none());

    let text = telemetry.metrics();
    assert_eq!(
        sample(&text, "http_requests_total", &[("path", "/products"), ("method", "GET"), ("status", "200")]),
        Some(1.0)
    );
}
