//! Environment-driven daemon settings.
//!
//! All knobs come from `DRAYHORSE_*` variables plus `DATABASE_URL`; unset
//! variables fall back to the engine defaults.

use std::env;
use std::time::Duration;

use drayhorse_core::EngineConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Postgres connection string; required for the foreground run.
    pub database_url: Option<String>,
    pub config: EngineConfig,
    /// How long a graceful stop waits for in-flight jobs.
    pub drain_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = EngineConfig::default();

        if let Some(raw) = get("DRAYHORSE_QUEUES") {
            config = config.with_queues(split_queues(&raw));
        }
        if let Some(secs) = parse_u64(&get, "DRAYHORSE_POLL_INTERVAL_SECS") {
            config = config.with_poll_interval(Duration::from_secs(secs));
        }
        if let Some(size) = parse_u64(&get, "DRAYHORSE_POOL_SIZE") {
            config = config.with_pool_size(size as usize);
        }
        if let Some(fails) = parse_u64(&get, "DRAYHORSE_MAX_GLOBAL_LOCK_FAILS") {
            config = config.with_max_global_lock_fails(fails as u32);
        }
        if let Some(secs) = parse_u64(&get, "DRAYHORSE_GLOBAL_LOCK_TIMEOUT_SECS") {
            config = config.with_global_lock_timeout(Duration::from_secs(secs));
        }
        if let Some(enabled) = parse_env_bool(&get, "DRAYHORSE_PERFORM_JOBS_IN_TX") {
            config = config.perform_jobs_in_tx(enabled);
        }
        if let Some(enabled) = parse_env_bool(&get, "DRAYHORSE_CLEAN_STUCK_JOBS") {
            config = config.clean_stuck_jobs(enabled);
        }
        if let Some(secs) = parse_u64(&get, "DRAYHORSE_STALE_LOCKED_THRESHOLD_SECS") {
            config.stale_detection_locked_to_started_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get, "DRAYHORSE_STALE_RUN_TIME_THRESHOLD_SECS") {
            config.stale_detection_run_time_threshold = Duration::from_secs(secs);
        }
        if let Some(mb) = parse_u64(&get, "DRAYHORSE_MAX_WORKER_MEMORY_MB") {
            config = config.with_max_worker_memory_mb(mb);
        }
        if let Some(enabled) = parse_env_bool(&get, "DRAYHORSE_LOCK_SHELL_COMMANDS") {
            config.lock_shell_commands = enabled;
        }
        if let Some(enabled) = parse_env_bool(&get, "DRAYHORSE_SILENCE_POLLER_EXCEPTIONS") {
            config.silence_poller_exceptions = enabled;
        }
        if let Some(enabled) = parse_env_bool(&get, "DRAYHORSE_SILENCE_WATCHER") {
            config.silence_watcher = enabled;
        }

        let drain_timeout = parse_u64(&get, "DRAYHORSE_DRAIN_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Self {
            database_url: get("DATABASE_URL"),
            config,
            drain_timeout,
        }
    }
}

fn parse_u64(get: impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    get(name)?.trim().parse().ok()
}

fn parse_env_bool(get: impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    parse_bool(&get(name)?)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_queues(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
