//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → environment overrides (collector endpoint, service name, profiler URL)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig (validated, immutable)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ExportProtocol, FailurePolicy, ListenerConfig, LogFormat, ObservabilityConfig, ProfilingConfig,
    RefresherConfig, ServiceConfig, ShutdownConfig, TimeoutConfig, TracingConfig,
};
pub use validation::ValidationError;
