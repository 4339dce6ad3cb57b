use std::sync::Mutex;

use sysinfo::{Pid, System};
use tracing::debug;

/// Source of the memory-pressure ratio consulted during admission.
pub trait MemoryProbe: Send + Sync {
    /// Fraction in `[0, 1]` of memory in use.
    fn usage_ratio(&self) -> f64;
}

/// Resident memory of this process relative to the memory it may use: the
/// cgroup limit when one applies, otherwise total physical memory.
pub struct MemoryMonitor {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(error) => {
                debug!(error, "current pid unavailable; memory pressure reported as zero");
                None
            }
        };
        Self { system: Mutex::new(System::new()), pid }
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for MemoryMonitor {
    fn usage_ratio(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut system = self.system.lock().expect("memory monitor lock poisoned");
        system.refresh_memory();
        if !system.refresh_process(pid) {
            return 0.0;
        }

        let host_total = system.total_memory();
        if host_total == 0 {
            return 0.0;
        }
        let cgroup_total = system.cgroup_limits().map(|limits| limits.total_memory);
        let resident = system.process(pid).map_or(0, |process| process.memory());
        ratio(resident, memory_budget(host_total, cgroup_total))
    }
}

/// Fixed ratio, for tests and for disabling the memory check.
pub struct StaticMemory(pub f64);

impl MemoryProbe for StaticMemory {
    fn usage_ratio(&self) -> f64 {
        self.0
    }
}

/// A container limit caps the budget; an unset or zero limit leaves host memory.
fn memory_budget(host_total: u64, cgroup_total: Option<u64>) -> u64 {
    match cgroup_total {
        Some(limit) if limit > 0 => limit.min(host_total),
        _ => host_total,
    }
}

fn ratio(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64).clamp(0.0, 1.0)
}
