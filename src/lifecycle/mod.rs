//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Logging → Profiler → Tracers → Metrics → Listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Join background tasks → Flush tracers → Stop profiler
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then telemetry, then listeners
//! - Shutdown has timeout: stuck tasks are aborted after the grace period

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{wait_for_signal, Signal};
