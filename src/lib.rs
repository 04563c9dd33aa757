//! Inventory service with a request observability pipeline.

pub mod config;
pub mod http;
pub mod inventory;
pub mod lifecycle;
pub mod observability;
pub mod profiling;

pub use config::ServiceConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use observability::Observability;
