//! Middleware shared by every inventory route.

pub mod instrument;

pub use instrument::{instrument, instrument_request, RequestGuard, TraceContext, X_REQUEST_ID};
