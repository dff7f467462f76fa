//! Producer-side enqueue surface.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use drayhorse_core::{EngineError, EngineResult, JobId, JobPayload, NewJob};

use crate::store::JobStore;

/// Thin handle for inserting jobs; clone freely across producer threads.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn JobStore>,
}

impl Enqueuer {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Enqueue a job for immediate execution on the default queue.
    pub fn enqueue(&self, payload: JobPayload) -> EngineResult<JobId> {
        self.enqueue_job(NewJob::new(payload.into_value()))
    }

    /// Enqueue a job that becomes due at `run_at`.
    pub fn enqueue_at(&self, payload: JobPayload, run_at: DateTime<Utc>) -> EngineResult<JobId> {
        self.enqueue_job(NewJob::new(payload.into_value()).run_at(run_at))
    }

    /// Enqueue a fully specified job (queue, priority, schedule).
    pub fn enqueue_job(&self, job: NewJob) -> EngineResult<JobId> {
        let queue = job.queue.clone();
        let id = self.store.enqueue(job).map_err(EngineError::from)?;
        debug!(job_id = %id, queue = %queue, "job enqueued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use drayhorse_core::JobState;

    fn enqueuer() -> (Enqueuer, Arc<dyn JobStore>) {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        (Enqueuer::new(store.clone()), store)
    }

    #[test]
    fn enqueued_job_is_waiting_and_due() {
        let (enqueuer, store) = enqueuer();
        let id = enqueuer
            .enqueue(JobPayload::new("mailer.send", serde_json::json!({"to": "a@b"})))
            .unwrap();

        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert!(record.is_due(Utc::now()));
        assert_eq!(record.payload["handler"], "mailer.send");
    }

    #[test]
    fn scheduled_job_carries_run_at() {
        let (enqueuer, store) = enqueuer();
        let run_at = Utc::now() + chrono::Duration::hours(2);
        let id = enqueuer
            .enqueue_at(JobPayload::new("reports.nightly", serde_json::json!({})), run_at)
            .unwrap();

        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.run_at, run_at);
        assert!(!record.is_due(Utc::now()));
    }

    #[test]
    fn enqueue_job_preserves_queue_and_priority() {
        let (enqueuer, store) = enqueuer();
        let job = NewJob::new(
            JobPayload::new("billing.charge", serde_json::json!({})).into_value(),
        )
        .on_queue("billing")
        .with_priority(-5);
        let id = enqueuer.enqueue_job(job).unwrap();

        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.queue, "billing");
        assert_eq!(record.priority, -5);
    }
}
