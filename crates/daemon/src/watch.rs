//! Cron-style health check for the worker process.
//!
//! One shot per invocation: start the worker if it is down, or gracefully
//! restart it when its resident set exceeds the configured ceiling. A zero
//! ceiling disables the memory check.

use std::time::Duration;

use drayhorse_core::EngineConfig;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::warn;

use crate::supervisor::{DaemonError, ProcessStatus, Supervisor};

const RESTART_STOP_WAIT: Duration = Duration::from_secs(60);

pub trait MemorySampler {
    /// Resident set size of `pid` in megabytes, if the process exists.
    fn rss_mb(&self, pid: u32) -> Option<u64>;
}

pub struct SysinfoSampler;

impl MemorySampler for SysinfoSampler {
    fn rss_mb(&self, pid: u32) -> Option<u64> {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = System::new_with_specifics(RefreshKind::nothing());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory() / (1024 * 1024))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    /// Worker was down and has been started.
    Start,
    /// Worker exceeded the memory ceiling and has been restarted.
    Restart { rss_mb: u64 },
    /// Nothing to do.
    Healthy,
}

/// Pure decision: what the watcher should do given the worker's liveness
/// and memory footprint.
pub fn decide(
    running_pid: Option<u32>,
    ceiling_mb: u64,
    sampler: &dyn MemorySampler,
) -> WatchAction {
    let Some(pid) = running_pid else {
        return WatchAction::Start;
    };
    if ceiling_mb == 0 {
        return WatchAction::Healthy;
    }
    match sampler.rss_mb(pid) {
        Some(rss_mb) if rss_mb > ceiling_mb => WatchAction::Restart { rss_mb },
        _ => WatchAction::Healthy,
    }
}

/// Execute one watch cycle against the supervisor.
pub fn run_watch(
    supervisor: &Supervisor,
    config: &EngineConfig,
    sampler: &dyn MemorySampler,
) -> Result<WatchAction, DaemonError> {
    let running_pid = match supervisor.status() {
        ProcessStatus::Running { pid } => Some(pid as u32),
        ProcessStatus::NotRunning => None,
    };

    let action = decide(running_pid, config.max_worker_memory_mb, sampler);
    match action {
        WatchAction::Start => {
            supervisor.start()?;
            if !config.silence_watcher {
                println!("worker process was down, started");
            }
        }
        WatchAction::Restart { rss_mb } => {
            warn!(
                rss_mb,
                ceiling_mb = config.max_worker_memory_mb,
                "worker over memory ceiling, restarting"
            );
            supervisor.restart(RESTART_STOP_WAIT)?;
            if !config.silence_watcher {
                println!(
                    "worker at {rss_mb} MB exceeded {} MB, restarted",
                    config.max_worker_memory_mb
                );
            }
        }
        WatchAction::Healthy => {}
    }
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSampler(Option<u64>);

    impl MemorySampler for FixedSampler {
        fn rss_mb(&self, _pid: u32) -> Option<u64> {
            self.0
        }
    }

    #[test]
    fn dead_worker_is_started() {
        assert_eq!(
            decide(None, 512, &FixedSampler(None)),
            WatchAction::Start
        );
    }

    #[test]
    fn worker_over_ceiling_is_restarted() {
        assert_eq!(
            decide(Some(42), 512, &FixedSampler(Some(600))),
            WatchAction::Restart { rss_mb: 600 }
        );
    }

    #[test]
    fn worker_under_ceiling_is_left_alone() {
        assert_eq!(
            decide(Some(42), 512, &FixedSampler(Some(100))),
            WatchAction::Healthy
        );
    }

    #[test]
    fn zero_ceiling_disables_memory_check() {
        assert_eq!(
            decide(Some(42), 0, &FixedSampler(Some(u64::MAX))),
            WatchAction::Healthy
        );
    }

    #[test]
    fn unsampleable_process_is_not_restarted() {
        assert_eq!(
            decide(Some(42), 512, &FixedSampler(None)),
            WatchAction::Healthy
        );
    }
}
