//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, graceful shutdown)
//!     → middleware/instrument.rs (request id, span, in-flight gauge)
//!     → handlers.rs (storage calls wrapped in profiled spans)
//!     → error.rs (domain errors → JSON error responses)
//!     → response.rs (status captured once for metrics, span and log)
//!     → Send to client
//!
//! Separate listener:
//!     → metrics_endpoint.rs (GET /metrics, Prometheus text)
//! ```

pub mod error;
pub mod handlers;
pub mod metrics_endpoint;
pub mod middleware;
pub mod response;
pub mod server;

pub use error::AppError;
pub use metrics_endpoint::{metrics_router, serve_metrics};
pub use middleware::{instrument, TraceContext, X_REQUEST_ID};
pub use response::{HandlerFailure, ResponseCapture};
pub use server::{build_router, AppState, HttpServer};
