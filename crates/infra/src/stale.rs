//! Stale-job detection.
//!
//! Flags rows that have sat in `locked` without starting, or in `running`
//! past the expected run time. Detection only reports; it never resets or
//! kills anything, because a long-running row may still be making progress.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use drayhorse_core::{EngineConfig, EngineError, EngineResult, JobRecord, JobState};

use crate::store::JobStore;

pub struct StaleJobDetector {
    store: Arc<dyn JobStore>,
    config: EngineConfig,
}

impl StaleJobDetector {
    pub fn new(store: Arc<dyn JobStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Check for stale rows as of `now`. Returns `Ok(())` when none are
    /// found; otherwise reports through the exception callback and returns
    /// the stale-jobs error.
    pub fn check(&self, now: DateTime<Utc>) -> EngineResult<()> {
        let stale = self
            .store
            .find_stale(
                self.config.stale_detection_locked_to_started_threshold,
                self.config.stale_detection_run_time_threshold,
                now,
            )
            .map_err(EngineError::from)?;

        if stale.is_empty() {
            return Ok(());
        }

        let detail = stale
            .iter()
            .map(|record| describe(record, now))
            .collect::<Vec<_>>()
            .join("; ");
        warn!(count = stale.len(), detail = %detail, "stale jobs detected");

        let err = EngineError::StaleJobs {
            count: stale.len(),
            detail,
        };
        self.config.report_exception(&err);
        Err(err)
    }
}

fn describe(record: &JobRecord, now: DateTime<Utc>) -> String {
    let age = match record.state {
        JobState::Locked => record.locked_at.map(|at| now - at),
        JobState::Running => record.started_at.map(|at| now - at),
        _ => None,
    };
    match age {
        Some(age) => format!(
            "job {} {} for {}s on queue '{}'",
            record.id,
            record.state,
            age.num_seconds(),
            record.queue
        ),
        None => format!("job {} {} on queue '{}'", record.id, record.state, record.queue),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::store::InMemoryJobStore;
    use drayhorse_core::{JobPayload, NewJob, PerformerId};

    fn store_with_locked_job(locked_at: DateTime<Utc>) -> (Arc<dyn JobStore>, drayhorse_core::JobId) {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let id = store
            .enqueue(
                NewJob::new(JobPayload::new("noop", serde_json::json!({})).into_value())
                    .run_at(locked_at),
            )
            .unwrap();
        store
            .claim_batch(&[], 1, &PerformerId("host.1.0".into()), locked_at)
            .unwrap();
        (store, id)
    }

    #[test]
    fn flags_claim_older_than_threshold() {
        let now = Utc::now();
        let (store, id) = store_with_locked_job(now - chrono::Duration::seconds(600));

        static REPORTED: AtomicUsize = AtomicUsize::new(0);
        let config = EngineConfig::default()
            .with_stale_thresholds(Duration::from_secs(180), Duration::from_secs(720))
            .on_exception(|err| {
                assert!(matches!(err, EngineError::StaleJobs { count: 1, .. }));
                REPORTED.fetch_add(1, Ordering::SeqCst);
            });

        let detector = StaleJobDetector::new(store, config);
        let err = detector.check(now).unwrap_err();
        assert!(err.to_string().contains(&id.to_string()));
        assert_eq!(REPORTED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fresh_claim_is_not_stale() {
        let now = Utc::now();
        let (store, _) = store_with_locked_job(now - chrono::Duration::seconds(30));

        let config = EngineConfig::default()
            .with_stale_thresholds(Duration::from_secs(180), Duration::from_secs(720));
        let detector = StaleJobDetector::new(store, config);
        detector.check(now).unwrap();
    }

    #[test]
    fn zero_threshold_disables_the_check() {
        let now = Utc::now();
        let (store, _) = store_with_locked_job(now - chrono::Duration::days(7));

        let config = EngineConfig::default()
            .with_stale_thresholds(Duration::ZERO, Duration::ZERO);
        let detector = StaleJobDetector::new(store, config);
        detector.check(now).unwrap();
    }

    #[test]
    fn flags_long_running_job() {
        let now = Utc::now();
        let started = now - chrono::Duration::seconds(1000);
        let (store, id) = store_with_locked_job(started);
        store
            .mark_running(id, &PerformerId("host.1.0".into()), started)
            .unwrap();

        let config = EngineConfig::default()
            .with_stale_thresholds(Duration::from_secs(180), Duration::from_secs(720));
        let detector = StaleJobDetector::new(store, config);
        let err = detector.check(now).unwrap_err();
        assert!(err.to_string().contains("running"));
    }
}
