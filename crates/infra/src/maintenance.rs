//! Housekeeping jobs.
//!
//! These are ordinary handlers meant to be enqueued on a schedule by an
//! external cron, so maintenance runs through the same claim/execute path
//! as application jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use drayhorse_core::{
    EngineConfig, HandlerError, HandlerRegistry, JobHandler, PerformContext,
};

use crate::stale::StaleJobDetector;
use crate::store::JobStore;

pub const DETECT_STALE_JOBS: &str = "maintenance.detect_stale_jobs";
pub const CLEANUP_SUCCEEDED_JOBS: &str = "maintenance.cleanup_succeeded_jobs";

const DEFAULT_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Runs the stale-job audit and fails the job when stale rows exist, so the
/// failure shows up on the dashboard alongside the callback report.
pub struct DetectStaleJobs {
    detector: StaleJobDetector,
}

impl DetectStaleJobs {
    pub fn new(store: Arc<dyn JobStore>, config: EngineConfig) -> Self {
        Self {
            detector: StaleJobDetector::new(store, config),
        }
    }
}

impl JobHandler for DetectStaleJobs {
    fn perform(
        &self,
        _args: &serde_json::Value,
        _ctx: &mut PerformContext<'_>,
    ) -> Result<(), HandlerError> {
        self.detector
            .check(Utc::now())
            .map_err(|err| HandlerError::new(err.to_string()))
    }
}

/// Deletes `succeeded` rows older than the retention window. The window
/// defaults to 14 days and can be overridden per job with a
/// `{"retention_days": n}` argument.
pub struct CleanupSucceededJobs {
    store: Arc<dyn JobStore>,
    max_age: Duration,
}

impl CleanupSucceededJobs {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            max_age: DEFAULT_RETENTION,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

impl JobHandler for CleanupSucceededJobs {
    fn perform(
        &self,
        args: &serde_json::Value,
        _ctx: &mut PerformContext<'_>,
    ) -> Result<(), HandlerError> {
        let max_age = match args.get("retention_days").and_then(|v| v.as_u64()) {
            Some(days) => Duration::from_secs(days * 24 * 60 * 60),
            None => self.max_age,
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| HandlerError::new(e.to_string()))?;
        let deleted = self
            .store
            .delete_succeeded_before(cutoff)
            .map_err(|e| HandlerError::new(e.to_string()))?;
        if deleted > 0 {
            info!(deleted, %cutoff, "purged succeeded jobs");
        }
        Ok(())
    }
}

/// Register both maintenance handlers under their well-known names.
pub fn register_maintenance_handlers(
    registry: &mut HandlerRegistry,
    store: Arc<dyn JobStore>,
    config: &EngineConfig,
) {
    registry.register(
        DETECT_STALE_JOBS,
        DetectStaleJobs::new(store.clone(), config.clone()),
    );
    registry.register(CLEANUP_SUCCEEDED_JOBS, CleanupSucceededJobs::new(store));
}
