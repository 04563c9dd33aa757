//! Point-in-time resource samples.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use sysinfo::{Pid, System};

use crate::profiling::alloc::{AllocationStats, AllocationWindow};
use crate::profiling::ProfileType;

/// One sample. Only the selected profile types are filled in.
///
/// CPU time and `alloc_*` cover the interval since the previous sample;
/// `inuse_*`, `workers` and `alive_tasks` are instantaneous.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSample {
    /// Unix time in milliseconds.
    pub timestamp_ms: u64,
    pub cpu_seconds: Option<f64>,
    pub alloc_objects: Option<u64>,
    pub alloc_bytes: Option<u64>,
    pub inuse_objects: Option<u64>,
    /// Resident memory of the process.
    pub inuse_bytes: Option<u64>,
    pub workers: Option<usize>,
    pub alive_tasks: Option<usize>,
}

/// Samples the current process through `sysinfo` and the allocator counters.
pub struct ResourceSampler {
    types: Vec<ProfileType>,
    system: System,
    pid: Option<Pid>,
    last_refresh: Instant,
    allocations: AllocationWindow,
}

impl ResourceSampler {
    pub fn new(types: &[ProfileType]) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(reason) => {
                tracing::warn!(reason, "Process metrics unavailable, cpu and inuse_space stay empty");
                None
            }
        };

        let mut sampler = Self {
            types: types.to_vec(),
            system: System::new(),
            pid,
            last_refresh: Instant::now(),
            allocations: AllocationWindow::new(),
        };
        // CPU usage is measured between two refreshes; this one is the baseline.
        sampler.refresh_process();
        sampler
    }

    /// Take a sample of the selected profile types.
    pub fn sample(&mut self) -> ResourceSample {
        let mut sample = ResourceSample {
            timestamp_ms: unix_millis(),
            ..ResourceSample::default()
        };

        let needs_process = self
            .types
            .iter()
            .any(|t| matches!(t, ProfileType::Cpu | ProfileType::InuseSpace));
        let elapsed = self.last_refresh.elapsed().as_secs_f64();
        let refreshed = needs_process && self.refresh_process();
        let process = self.pid.filter(|_| refreshed).and_then(|pid| self.system.process(pid));

        let window = self.allocations.advance();
        let totals = AllocationStats::current();

        for kind in &self.types {
            match kind {
                ProfileType::Cpu => {
                    sample.cpu_seconds = process.map(|p| f64::from(p.cpu_usage()) / 100.0 * elapsed);
                }
                ProfileType::AllocObjects => sample.alloc_objects = Some(window.alloc_objects),
                ProfileType::AllocSpace => sample.alloc_bytes = Some(window.alloc_bytes),
                ProfileType::InuseObjects => sample.inuse_objects = Some(totals.inuse_objects()),
                ProfileType::InuseSpace => sample.inuse_bytes = process.map(|p| p.memory()),
                ProfileType::Workers => {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        let metrics = handle.metrics();
                        sample.workers = Some(metrics.num_workers());
                        sample.alive_tasks = Some(metrics.num_alive_tasks());
                    }
                }
            }
        }

        sample
    }

    fn refresh_process(&mut self) -> bool {
        self.last_refresh = Instant::now();
        match self.pid {
            Some(pid) => self.system.refresh_process(pid),
            None => false,
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
