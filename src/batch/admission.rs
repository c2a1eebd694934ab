//! Admission control: a process-wide task cap plus resource backpressure.
//!
//! Every worker holds a permit from one engine-wide semaphore
//! (`performance.max_concurrent_tasks`) while it runs a task, so many jobs
//! with large pools still share a bounded number of concurrent conversions.
//! After getting a permit the worker samples the [`ResourceProbe`]; while
//! process memory or CPU usage sits above the job's limits it waits and
//! re-samples, emitting one `Throttled` event per episode.

use super::events::JobEvent;
use super::job::Job;
use super::retry::cancelled;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, RefreshKind, System};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// One reading of resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    /// Resident memory of this process, in MB.
    pub memory_mb: u64,
    /// Global CPU usage, 0–100.
    pub cpu_percent: f64,
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Probe backed by `sysinfo`.
pub struct SystemProbe {
    sys: Mutex<System>,
    pid: Option<Pid>,
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe").field("pid", &self.pid).finish()
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            sys: Mutex::new(sys),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceUsage {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu();
        let memory_bytes = match self.pid {
            Some(pid) => {
                sys.refresh_process(pid);
                sys.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => {
                sys.refresh_memory();
                sys.used_memory()
            }
        };
        ResourceUsage {
            memory_mb: memory_bytes / (1024 * 1024),
            cpu_percent: sys.global_cpu_info().cpu_usage() as f64,
        }
    }
}

/// Fixed reading, for tests and for deployments that opt out of probing.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub ResourceUsage);

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceUsage {
        self.0
    }
}

pub(crate) struct AdmissionGate {
    permits: Arc<Semaphore>,
    probe: Arc<dyn ResourceProbe>,
}

impl AdmissionGate {
    pub(crate) fn new(max_concurrent_tasks: usize, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            probe,
        }
    }

    /// Wait for a permit and for resource usage to fall under the job's
    /// limits. `None` if the job is cancelled while waiting.
    pub(crate) async fn admit(
        &self,
        job: &Job,
        events: &broadcast::Sender<JobEvent>,
    ) -> Option<OwnedSemaphorePermit> {
        let mut cancel = job.cancel_signal();
        let permit = tokio::select! {
            p = Arc::clone(&self.permits).acquire_owned() => p.ok()?,
            _ = cancelled(&mut cancel) => return None,
        };

        let perf = &job.config.performance;
        let poll = Duration::from_millis(perf.backpressure_poll_ms.max(1));
        let mut throttled = false;
        loop {
            let usage = self.probe.sample();
            if usage.memory_mb <= perf.memory_limit_mb && usage.cpu_percent <= perf.cpu_limit_percent {
                if throttled {
                    debug!(job_id = %job.id, "Resource usage back under limits");
                }
                return Some(permit);
            }
            if !throttled {
                warn!(
                    job_id = %job.id,
                    memory_mb = usage.memory_mb,
                    cpu_percent = usage.cpu_percent,
                    "Admission throttled: resource usage above limits"
                );
                let _ = events.send(JobEvent::Throttled {
                    job_id: job.id,
                    memory_mb: usage.memory_mb,
                    cpu_percent: usage.cpu_percent,
                });
                throttled = true;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = cancelled(&mut cancel) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_probe_reports_sane_numbers() {
        let usage = SystemProbe::new().sample();
        assert!(usage.cpu_percent >= 0.0);
        assert!(usage.cpu_percent.is_finite());
    }
}
