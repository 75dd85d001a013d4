//! OS process table and CPU accounting backed by `sysinfo`.

use crate::error::SampleError;
use crate::sampler::{CpuMeter, ProcessEntry, ProcessLister};
use std::sync::{Mutex, MutexGuard};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Shared `sysinfo::System` used for both enumeration and CPU time.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn system(&self) -> Result<MutexGuard<'_, System>, SampleError> {
        self.system
            .lock()
            .map_err(|_| SampleError::ProcessListUnavailable("process probe lock poisoned".into()))
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLister for SystemProbe {
    fn list(&self) -> Result<Vec<ProcessEntry>, SampleError> {
        let mut system = self.system()?;
        system.refresh_processes(ProcessesToUpdate::All, true);

        Ok(system
            .processes()
            .iter()
            .map(|(pid, process)| {
                ProcessEntry::new(process.name().to_string_lossy().into_owned(), pid.as_u32())
            })
            .collect())
    }
}

impl CpuMeter for SystemProbe {
    fn cumulative_cpu_seconds(&self, pid: u32) -> Result<f64, SampleError> {
        let mut system = self.system().map_err(|e| SampleError::CpuUnavailable {
            pid,
            reason: e.to_string(),
        })?;
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );

        system
            .process(sys_pid)
            // CPU-milliseconds summed over every thread of the process.
            .map(|process| process.accumulated_cpu_time() as f64 / 1000.0)
            .ok_or(SampleError::CpuUnavailable {
                pid,
                reason: "process not found".into(),
            })
    }
}

/// Logical CPU count used to normalize utilization.
pub fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_lists_own_process() {
        let probe = SystemProbe::new();
        let own = std::process::id();
        let entries = probe.list().unwrap();
        assert!(entries.iter().any(|e| e.pid == own));
    }

    #[test]
    fn test_own_cpu_time_is_measured() {
        let probe = SystemProbe::new();
        let started = Instant::now();
        let mut acc = 0u64;
        while started.elapsed() < Duration::from_millis(300) {
            acc = std::hint::black_box(acc.wrapping_mul(31).wrapping_add(7));
        }

        let secs = probe.cumulative_cpu_seconds(std::process::id()).unwrap();
        assert!(secs > 0.0, "expected CPU time after a busy loop, got {}", secs);
    }

    #[test]
    fn test_unknown_pid_is_unavailable() {
        let probe = SystemProbe::new();
        assert!(matches!(
            probe.cumulative_cpu_seconds(u32::MAX - 1),
            Err(SampleError::CpuUnavailable { .. })
        ));
    }

    #[test]
    fn test_logical_cores_positive() {
        assert!(logical_cores() >= 1);
    }
}
