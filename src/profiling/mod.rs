//! Continuous profiling subsystem.
//!
//! # Data Flow
//! ```text
//! alloc.rs (stats_alloc counters) ──┐
//! sysinfo (process CPU, memory) ────┼→ sampler.rs (ResourceSample)
//! Tokio runtime metrics ────────────┘        │
//!                                             ▼
//!                agent.rs (fold per type → POST <url>/ingest?format=folded)
//! ```

pub mod agent;
pub mod alloc;
pub mod sampler;

pub use agent::{
    start_or_disable, Aggregation, ContinuousProfiler, FoldedProfile, ProfileType, ProfilerError, ProfilerHandle,
    ProfilerSettings,
};
pub use alloc::{AllocationStats, AllocationWindow, InstrumentedAllocator, INSTRUMENTED_SYSTEM};
pub use sampler::{ResourceSample, ResourceSampler};
