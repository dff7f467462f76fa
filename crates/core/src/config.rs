//! Engine configuration.
//!
//! One immutable configuration object is built at startup and handed to each
//! component at construction. Callbacks (exception reporting) are injected
//! here so tests can observe them with fakes instead of reaching for
//! process-global state.

use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;

/// Callback invoked with every unhandled handler failure and every fatal
/// poller condition.
pub type ExceptionCallback = Arc<dyn Fn(&EngineError) + Send + Sync>;

/// Process-wide engine configuration, immutable after startup.
#[derive(Clone)]
pub struct EngineConfig {
    /// Queues this poller services; empty means all queues.
    pub queues: Vec<String>,
    /// Sleep between poll cycles.
    pub poll_interval: Duration,
    /// Number of worker threads in the pool.
    pub pool_size: usize,
    /// Bounded wait for one global lock acquisition attempt.
    pub global_lock_timeout: Duration,
    /// Consecutive acquisition failures tolerated before the poller treats
    /// the condition as fatal.
    pub max_global_lock_fails: u32,
    /// Run handler side effects and the `succeeded` finalization in one
    /// storage transaction.
    pub perform_jobs_in_tx: bool,
    /// On poller startup, reset `locked`/`running` rows back to `waiting`
    /// on the assumption they are orphans of a crashed process.
    pub clean_stuck_jobs: bool,
    /// Maximum age of a `locked` claim before the stale detector flags it.
    /// Zero disables the check.
    pub stale_detection_locked_to_started_threshold: Duration,
    /// Maximum run time before the stale detector flags a `running` row.
    /// Zero disables the check.
    pub stale_detection_run_time_threshold: Duration,
    /// RSS ceiling for the managed worker process; the `watch` command
    /// restarts it above this. Zero disables the check.
    pub max_worker_memory_mb: u64,
    /// Serialize state-changing CLI commands through a lockfile.
    pub lock_shell_commands: bool,
    /// Suppress the exception callback (not the log line) for fatal poller
    /// conditions.
    pub silence_poller_exceptions: bool,
    /// Suppress informational `watch` output.
    pub silence_watcher: bool,
    /// Exception callback; defaults to a no-op.
    pub on_exception: ExceptionCallback,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            poll_interval: Duration::from_secs(60),
            pool_size: 1,
            global_lock_timeout: Duration::from_secs(5),
            max_global_lock_fails: 10,
            perform_jobs_in_tx: true,
            clean_stuck_jobs: false,
            stale_detection_locked_to_started_threshold: Duration::from_secs(3 * 60),
            stale_detection_run_time_threshold: Duration::from_secs(12 * 60),
            max_worker_memory_mb: 0,
            lock_shell_commands: true,
            silence_poller_exceptions: false,
            silence_watcher: false,
            on_exception: Arc::new(|_| {}),
        }
    }
}

impl EngineConfig {
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn with_max_global_lock_fails(mut self, fails: u32) -> Self {
        self.max_global_lock_fails = fails.max(1);
        self
    }

    pub fn with_global_lock_timeout(mut self, timeout: Duration) -> Self {
        self.global_lock_timeout = timeout;
        self
    }

    pub fn perform_jobs_in_tx(mut self, enabled: bool) -> Self {
        self.perform_jobs_in_tx = enabled;
        self
    }

    pub fn clean_stuck_jobs(mut self, enabled: bool) -> Self {
        self.clean_stuck_jobs = enabled;
        self
    }

    pub fn with_stale_thresholds(mut self, locked_to_started: Duration, run_time: Duration) -> Self {
        self.stale_detection_locked_to_started_threshold = locked_to_started;
        self.stale_detection_run_time_threshold = run_time;
        self
    }

    pub fn with_max_worker_memory_mb(mut self, mb: u64) -> Self {
        self.max_worker_memory_mb = mb;
        self
    }

    pub fn on_exception<F>(mut self, callback: F) -> Self
    where
        F: Fn(&EngineError) + Send + Sync + 'static,
    {
        self.on_exception = Arc::new(callback);
        self
    }

    /// Report an error through the exception callback.
    pub fn report_exception(&self, error: &EngineError) {
        (self.on_exception)(error);
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("queues", &self.queues)
            .field("poll_interval", &self.poll_interval)
            .field("pool_size", &self.pool_size)
            .field("global_lock_timeout", &self.global_lock_timeout)
            .field("max_global_lock_fails", &self.max_global_lock_fails)
            .field("perform_jobs_in_tx", &self.perform_jobs_in_tx)
            .field("clean_stuck_jobs", &self.clean_stuck_jobs)
            .field(
                "stale_detection_locked_to_started_threshold",
                &self.stale_detection_locked_to_started_threshold,
            )
            .field(
                "stale_detection_run_time_threshold",
                &self.stale_detection_run_time_threshold,
            )
            .field("max_worker_memory_mb", &self.max_worker_memory_mb)
            .field("lock_shell_commands", &self.lock_shell_commands)
            .field("silence_poller_exceptions", &self.silence_poller_exceptions)
            .field("silence_watcher", &self.silence_watcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_global_lock_fails, 10);
        assert!(config.perform_jobs_in_tx);
        assert!(!config.clean_stuck_jobs);
        assert_eq!(
            config.stale_detection_locked_to_started_threshold,
            Duration::from_secs(180)
        );
        assert_eq!(
            config.stale_detection_run_time_threshold,
            Duration::from_secs(720)
        );
        assert_eq!(config.max_worker_memory_mb, 0);
        assert!(config.lock_shell_commands);
    }

    #[test]
    fn pool_size_never_zero() {
        let config = EngineConfig::default().with_pool_size(0);
        assert_eq!(config.pool_size, 1);
    }

    #[test]
    fn exception_callback_is_invoked() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let config = EngineConfig::default().on_exception(|_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        });

        config.report_exception(&EngineError::storage("x"));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
