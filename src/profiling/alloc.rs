//! Allocation counters.
//!
//! The binary registers [`INSTRUMENTED_SYSTEM`] as its `#[global_allocator]`;
//! without it every counter stays at zero.

use std::alloc::System;

use stats_alloc::{Region, Stats, StatsAlloc};

pub use stats_alloc::INSTRUMENTED_SYSTEM;

/// The system allocator with allocation accounting.
pub type InstrumentedAllocator = StatsAlloc<System>;

/// Allocation counters, either cumulative or over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub alloc_objects: u64,
    pub alloc_bytes: u64,
    pub free_objects: u64,
    pub free_bytes: u64,
}

impl From<Stats> for AllocationStats {
    fn from(stats: Stats) -> Self {
        Self {
            alloc_objects: stats.allocations as u64,
            alloc_bytes: stats.bytes_allocated as u64,
            free_objects: stats.deallocations as u64,
            free_bytes: stats.bytes_deallocated as u64,
        }
    }
}

impl AllocationStats {
    /// Totals since process start.
    pub fn current() -> Self {
        INSTRUMENTED_SYSTEM.stats().into()
    }

    pub fn inuse_objects(&self) -> u64 {
        self.alloc_objects.saturating_sub(self.free_objects)
    }

    pub fn inuse_bytes(&self) -> u64 {
        self.alloc_bytes.saturating_sub(self.free_bytes)
    }
}

/// Allocation activity between successive calls to [`advance`](Self::advance).
pub struct AllocationWindow {
    region: Region<'static, System>,
}

impl AllocationWindow {
    pub fn new() -> Self {
        Self {
            region: Region::new(&INSTRUMENTED_SYSTEM),
        }
    }

    /// Counters since the previous call (or construction), then restart the window.
    pub fn advance(&mut self) -> AllocationStats {
        self.region.change_and_reset().into()
    }
}

impl Default for AllocationWindow {
    fn default() -> Self {
        Self::new()
    }
}
