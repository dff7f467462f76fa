//! Job storage abstraction.
//!
//! The relational table is the only shared mutable resource between
//! processes, so every lifecycle mutation goes through this trait. The claim
//! transition is a conditional update keyed on `id AND state = 'waiting'`;
//! a zero-row update means another claimant won, which is benign and
//! surfaces as a skipped row rather than an error.

use std::time::Duration;

use chrono::{DateTime, Utc};

use drayhorse_core::{
    AmbientTx, EngineError, HandlerError, JobId, JobRecord, JobState, NewJob, PerformerId,
};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    UnexpectedState {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::JobNotFound(id),
            StoreError::UnexpectedState {
                id,
                expected,
                actual,
            } => EngineError::UnexpectedState {
                id,
                expected,
                actual,
            },
            StoreError::Backend(msg) => EngineError::Storage(msg),
        }
    }
}

/// Outcome of a global lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Lock held for the duration of the body.
    Acquired,
    /// Bounded wait elapsed without acquisition; the body did not run.
    TimedOut,
}

/// Per-state row counts for dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub locked: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Mutations participating in one storage transaction.
///
/// Obtained through [`JobStore::transactionally`]; everything written through
/// it commits together or not at all.
pub trait UnitOfWork {
    /// Insert a `waiting` job inside the ambient transaction.
    fn insert_job(&mut self, job: NewJob) -> Result<JobId, StoreError>;

    /// Finalize a `running` job to `succeeded` inside the ambient
    /// transaction.
    fn mark_succeeded(&mut self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// View of this unit of work handed to handlers.
    fn as_ambient(&mut self) -> &mut dyn AmbientTx;
}

/// Closure executed against a [`UnitOfWork`]; an `Err` return rolls the
/// transaction back.
pub type TxBody<'a> = &'a mut dyn FnMut(&mut dyn UnitOfWork) -> Result<(), HandlerError>;

/// Persistent job store shared by enqueuers, pollers and workers.
pub trait JobStore: Send + Sync {
    /// Insert a `waiting` job and return its identifier.
    ///
    /// Constraint violations propagate to the caller; there is no retry.
    fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError>;

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Rows in a given state, oldest first. Dashboard surface.
    fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<JobRecord>, StoreError>;

    fn counts(&self) -> Result<JobCounts, StoreError>;

    /// Scan-and-claim: find `waiting` rows with `run_at <= now` on the given
    /// queues (empty slice = all queues), ordered by `(priority, run_at,
    /// id)`, and conditionally transition up to `limit` of them to `locked`.
    ///
    /// Rows lost to a concurrent claimant are silently skipped. Callers must
    /// hold the global lock while invoking this.
    fn claim_batch(
        &self,
        queues: &[String],
        limit: usize,
        locked_by: &PerformerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;

    /// `locked → running`, recording `started_at` and the executing worker
    /// as `locked_by`. Returns the updated record.
    fn mark_running(
        &self,
        id: JobId,
        performer: &PerformerId,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError>;

    /// `running → succeeded`; sets `finished_at`, clears the claim.
    fn mark_succeeded(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// `running → failed`; records `last_error`, sets `finished_at`, clears
    /// the claim.
    fn mark_failed(&self, id: JobId, error: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Manual retry surface: `failed → waiting`.
    fn reset_failed(&self, id: JobId) -> Result<(), StoreError>;

    /// Reset all `locked`/`running` rows to `waiting`. Startup cleanup for
    /// rows orphaned by a crashed process; returns how many were reset.
    fn clean_stuck_jobs(&self) -> Result<u64, StoreError>;

    /// Audit query: `locked` rows whose `locked_at` is older than
    /// `locked_threshold`, and `running` rows whose `started_at` is older
    /// than `running_threshold`. A zero threshold disables that check.
    fn find_stale(
        &self,
        locked_threshold: Duration,
        running_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Retention cleanup: delete `succeeded` rows finished before `cutoff`.
    fn delete_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Run `body` against a unit of work and commit only if it returns
    /// `Ok`. The outer `Result` is storage failure; the inner one is the
    /// body's outcome after a rollback.
    fn transactionally(&self, body: TxBody<'_>) -> Result<Result<(), HandlerError>, StoreError>;

    /// Run `body` while holding the cross-process advisory lock that
    /// serializes the scan-and-claim phase. Waits at most `timeout`; on
    /// timeout the body does not run.
    fn with_global_lock(
        &self,
        timeout: Duration,
        body: &mut dyn FnMut(),
    ) -> Result<LockOutcome, StoreError>;
}
