//! In-memory job store for tests/dev.
//!
//! Mirrors the Postgres implementation's semantics: conditional claim
//! updates, staged transactions with rollback, and a process-wide mutex
//! standing in for the advisory lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use drayhorse_core::{AmbientTx, HandlerError, JobId, JobRecord, JobState, NewJob, PerformerId};

use super::{JobCounts, JobStore, LockOutcome, StoreError, TxBody, UnitOfWork};

/// RwLock'd map of job records plus a mutex emulating the global advisory
/// lock.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    global: Mutex<()>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            global: Mutex::new(()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_state(record: &JobRecord, expected: JobState) -> Result<(), StoreError> {
    if record.state == expected {
        Ok(())
    } else {
        Err(StoreError::UnexpectedState {
            id: record.id,
            expected,
            actual: record.state,
        })
    }
}

fn claim_order(a: &JobRecord, b: &JobRecord) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.run_at.cmp(&b.run_at))
        .then(a.id.cmp(&b.id))
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        let record = job.into_record(Utc::now());
        let id = record.id;
        self.write().insert(id, record);
        Ok(id)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.read().get(&id).cloned())
    }

    fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.read();
        let mut result: Vec<_> = jobs.values().filter(|j| j.state == state).cloned().collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn counts(&self) -> Result<JobCounts, StoreError> {
        let jobs = self.read();
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Locked => counts.locked += 1,
                JobState::Running => counts.running += 1,
                JobState::Succeeded => counts.succeeded += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn claim_batch(
        &self,
        queues: &[String],
        limit: usize,
        locked_by: &PerformerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.write();

        let mut candidates: Vec<JobId> = {
            let mut eligible: Vec<&JobRecord> = jobs
                .values()
                .filter(|j| {
                    j.state == JobState::Waiting
                        && j.is_due(now)
                        && (queues.is_empty() || queues.iter().any(|q| q == &j.queue))
                })
                .collect();
            eligible.sort_by(|a, b| claim_order(a, b));
            eligible.iter().take(limit).map(|j| j.id).collect()
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates.drain(..) {
            // Conditional update: only a still-waiting row transitions.
            if let Some(job) = jobs.get_mut(&id) {
                if job.state != JobState::Waiting {
                    continue;
                }
                job.state = JobState::Locked;
                job.locked_at = Some(now);
                job.locked_by = Some(locked_by.clone());
                job.updated_at = now;
                claimed.push(id);
            }
        }

        Ok(claimed)
    }

    fn mark_running(
        &self,
        id: JobId,
        performer: &PerformerId,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        let mut jobs = self.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        expect_state(job, JobState::Locked)?;

        job.state = JobState::Running;
        job.started_at = Some(now);
        job.locked_by = Some(performer.clone());
        job.updated_at = now;
        Ok(job.clone())
    }

    fn mark_succeeded(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = self.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        expect_state(job, JobState::Running)?;

        job.state = JobState::Succeeded;
        job.finished_at = Some(now);
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        Ok(())
    }

    fn mark_failed(&self, id: JobId, error: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = self.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        expect_state(job, JobState::Running)?;

        job.state = JobState::Failed;
        job.last_error = Some(error.to_string());
        job.finished_at = Some(now);
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        Ok(())
    }

    fn reset_failed(&self, id: JobId) -> Result<(), StoreError> {
        let mut jobs = self.write();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        expect_state(job, JobState::Failed)?;

        job.state = JobState::Waiting;
        job.started_at = None;
        job.finished_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    fn clean_stuck_jobs(&self) -> Result<u64, StoreError> {
        let mut jobs = self.write();
        let now = Utc::now();
        let mut reset = 0;
        for job in jobs.values_mut() {
            if matches!(job.state, JobState::Locked | JobState::Running) {
                job.state = JobState::Waiting;
                job.locked_at = None;
                job.locked_by = None;
                job.started_at = None;
                job.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }

    fn find_stale(
        &self,
        locked_threshold: Duration,
        running_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let locked_cutoff = chrono::Duration::from_std(locked_threshold)
            .ok()
            .map(|d| now - d);
        let running_cutoff = chrono::Duration::from_std(running_threshold)
            .ok()
            .map(|d| now - d);

        let jobs = self.read();
        let mut stale: Vec<_> = jobs
            .values()
            .filter(|j| match j.state {
                JobState::Locked => {
                    !locked_threshold.is_zero()
                        && matches!((j.locked_at, locked_cutoff), (Some(at), Some(cut)) if at < cut)
                }
                JobState::Running => {
                    !running_threshold.is_zero()
                        && matches!((j.started_at, running_cutoff), (Some(at), Some(cut)) if at < cut)
                }
                _ => false,
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| (j.created_at, j.id));
        Ok(stale)
    }

    fn delete_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.state == JobState::Succeeded
                && j.finished_at.map(|at| at < cutoff).unwrap_or(false))
        });
        Ok((before - jobs.len()) as u64)
    }

    fn transactionally(&self, body: TxBody<'_>) -> Result<Result<(), HandlerError>, StoreError> {
        // The body runs without the map lock held so handlers may call back
        // into the store, matching Postgres where direct store calls go
        // through separate pool connections. Writes made through the unit
        // of work are staged as an op log and applied at commit; rollback
        // drops the log.
        let mut uow = InMemoryUow {
            staged: self.read().clone(),
            ops: Vec::new(),
        };

        match body(&mut uow) {
            Ok(()) => {
                let mut jobs = self.write();
                // Validate the whole log before applying any of it, so a
                // conflicting concurrent update cannot leave a half-applied
                // commit.
                for op in &uow.ops {
                    if let StagedOp::Succeed { id, .. } = op {
                        let job = jobs.get(id).ok_or(StoreError::NotFound(*id))?;
                        expect_state(job, JobState::Running)?;
                    }
                }
                for op in uow.ops {
                    match op {
                        StagedOp::Insert(record) => {
                            jobs.insert(record.id, record);
                        }
                        StagedOp::Succeed { id, at } => {
                            if let Some(job) = jobs.get_mut(&id) {
                                job.state = JobState::Succeeded;
                                job.finished_at = Some(at);
                                job.locked_at = None;
                                job.locked_by = None;
                                job.updated_at = at;
                            }
                        }
                    }
                }
                Ok(Ok(()))
            }
            Err(err) => Ok(Err(err)),
        }
    }

    fn with_global_lock(
        &self,
        timeout: Duration,
        body: &mut dyn FnMut(),
    ) -> Result<LockOutcome, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.global.try_lock() {
                Ok(_guard) => {
                    body();
                    return Ok(LockOutcome::Acquired);
                }
                Err(std::sync::TryLockError::Poisoned(_guard)) => {
                    body();
                    return Ok(LockOutcome::Acquired);
                }
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Ok(LockOutcome::TimedOut);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }
}

enum StagedOp {
    Insert(JobRecord),
    Succeed { id: JobId, at: DateTime<Utc> },
}

/// Staged unit of work: a snapshot of the job map for validation plus the
/// op log replayed at commit.
struct InMemoryUow {
    staged: HashMap<JobId, JobRecord>,
    ops: Vec<StagedOp>,
}

impl UnitOfWork for InMemoryUow {
    fn insert_job(&mut self, job: NewJob) -> Result<JobId, StoreError> {
        let record = job.into_record(Utc::now());
        let id = record.id;
        self.ops.push(StagedOp::Insert(record.clone()));
        self.staged.insert(id, record);
        Ok(id)
    }

    fn mark_succeeded(&mut self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let job = self.staged.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        expect_state(job, JobState::Running)?;

        job.state = JobState::Succeeded;
        job.finished_at = Some(now);
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        self.ops.push(StagedOp::Succeed { id, at: now });
        Ok(())
    }

    fn as_ambient(&mut self) -> &mut dyn AmbientTx {
        self
    }
}

impl AmbientTx for InMemoryUow {
    fn enqueue(&mut self, job: NewJob) -> Result<JobId, HandlerError> {
        self.insert_job(job)
            .map_err(|e| HandlerError::new(e.to_string()))
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drayhorse_core::JobPayload;

    fn payload(name: &str) -> serde_json::Value {
        JobPayload::new(name, serde_json::json!({})).into_value()
    }

    fn performer(tag: &str) -> PerformerId {
        PerformerId(format!("test-host.1.{tag}"))
    }

    #[test]
    fn enqueue_then_claim_then_finalize() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(NewJob::new(payload("noop"))).unwrap();
        let now = Utc::now();

        let claimed = store
            .claim_batch(&[], 10, &performer("poller"), now)
            .unwrap();
        assert_eq!(claimed, vec![id]);

        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.state, JobState::Locked);
        assert!(record.locked_at.is_some());

        let running = store.mark_running(id, &performer("w0"), now).unwrap();
        assert_eq!(running.state, JobState::Running);
        assert_eq!(running.started_at, Some(now));

        store.mark_succeeded(id, now).unwrap();
        let done = store.get(id).unwrap().unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert!(done.locked_by.is_none());
        assert_eq!(done.finished_at, Some(now));
    }

    #[test]
    fn claim_respects_run_at() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .enqueue(NewJob::new(payload("later")).run_at(now + chrono::Duration::seconds(30)))
            .unwrap();

        let claimed = store.claim_batch(&[], 10, &performer("p"), now).unwrap();
        assert!(claimed.is_empty());
    }

    #[test]
    fn claim_orders_by_priority_then_run_at_then_id() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let base = now - chrono::Duration::seconds(10);

        let p2 = store
            .enqueue(NewJob::new(payload("a")).with_priority(2).run_at(base))
            .unwrap();
        let p1 = store
            .enqueue(NewJob::new(payload("b")).with_priority(1).run_at(base))
            .unwrap();
        let p3 = store
            .enqueue(NewJob::new(payload("c")).with_priority(3).run_at(base))
            .unwrap();

        let claimed = store.claim_batch(&[], 3, &performer("p"), now).unwrap();
        assert_eq!(claimed, vec![p1, p2, p3]);
    }

    #[test]
    fn claim_filters_by_queue() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .enqueue(NewJob::new(payload("m")).on_queue("mailers").run_at(now))
            .unwrap();
        let reports = store
            .enqueue(NewJob::new(payload("r")).on_queue("reports").run_at(now))
            .unwrap();

        let claimed = store
            .claim_batch(&["reports".to_string()], 10, &performer("p"), now)
            .unwrap();
        assert_eq!(claimed, vec![reports]);
    }

    #[test]
    fn concurrent_claims_take_each_row_once() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = store.enqueue(NewJob::new(payload("contended"))).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store
                    .claim_batch(&[], 1, &PerformerId(format!("w{i}")), Utc::now())
                    .unwrap()
            }));
        }

        let winners: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|claimed| claimed.contains(&id))
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn mark_running_requires_locked() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(NewJob::new(payload("x"))).unwrap();

        let err = store
            .mark_running(id, &performer("w"), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnexpectedState {
                expected: JobState::Locked,
                actual: JobState::Waiting,
                ..
            }
        ));
    }

    #[test]
    fn failed_job_resets_to_waiting() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(NewJob::new(payload("x"))).unwrap();
        let now = Utc::now();
        store.claim_batch(&[], 1, &performer("p"), now).unwrap();
        store.mark_running(id, &performer("w"), now).unwrap();
        store.mark_failed(id, "boom", now).unwrap();

        store.reset_failed(id).unwrap();
        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert!(record.started_at.is_none());
        // Failure detail is kept for operators.
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn clean_stuck_jobs_resets_locked_and_running() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let a = store.enqueue(NewJob::new(payload("a")).run_at(now)).unwrap();
        let b = store.enqueue(NewJob::new(payload("b")).run_at(now)).unwrap();
        let c = store.enqueue(NewJob::new(payload("c")).run_at(now)).unwrap();

        store.claim_batch(&[], 2, &performer("p"), now).unwrap();
        store.mark_running(a, &performer("w"), now).unwrap();

        let reset = store.clean_stuck_jobs().unwrap();
        assert_eq!(reset, 2);
        for id in [a, b, c] {
            assert_eq!(store.get(id).unwrap().unwrap().state, JobState::Waiting);
        }
    }

    #[test]
    fn rolled_back_transaction_leaves_no_job() {
        let store = InMemoryJobStore::new();

        let outcome = store
            .transactionally(&mut |uow| {
                uow.insert_job(NewJob::new(payload("ghost")))
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                Err(HandlerError::new("business rollback"))
            })
            .unwrap();

        assert!(outcome.is_err());
        assert_eq!(store.counts().unwrap(), JobCounts::default());
    }

    #[test]
    fn committed_transaction_persists_job() {
        let store = InMemoryJobStore::new();

        store
            .transactionally(&mut |uow| {
                uow.insert_job(NewJob::new(payload("kept")))
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                Ok(())
            })
            .unwrap()
            .unwrap();

        assert_eq!(store.counts().unwrap().waiting, 1);
    }

    #[test]
    fn transaction_body_may_call_back_into_the_store() {
        // Handlers read and write the store directly from inside an
        // in-transaction perform; the body must not hold the map lock, and
        // the commit must not clobber those direct writes.
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let purged = store
            .enqueue(NewJob::new(payload("purged")).run_at(now))
            .unwrap();
        store.claim_batch(&[], 1, &performer("p"), now).unwrap();
        store.mark_running(purged, &performer("w"), now).unwrap();
        store
            .mark_succeeded(purged, now - chrono::Duration::days(30))
            .unwrap();

        store
            .transactionally(&mut |uow| {
                let deleted = store
                    .delete_succeeded_before(now - chrono::Duration::days(14))
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                assert_eq!(deleted, 1);
                uow.insert_job(NewJob::new(payload("follow-up")))
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                Ok(())
            })
            .unwrap()
            .unwrap();

        assert!(store.get(purged).unwrap().is_none());
        assert_eq!(store.counts().unwrap().waiting, 1);
    }

    #[test]
    fn stale_detection_thresholds() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store
            .enqueue(NewJob::new(payload("slow")).run_at(now))
            .unwrap();
        store.claim_batch(&[], 1, &performer("p"), now).unwrap();

        // Within threshold: not stale.
        let stale = store
            .find_stale(Duration::from_secs(60), Duration::from_secs(60), now)
            .unwrap();
        assert!(stale.is_empty());

        // Past threshold: flagged.
        let later = now + chrono::Duration::seconds(120);
        let stale = store
            .find_stale(Duration::from_secs(60), Duration::from_secs(60), later)
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);

        // Zero threshold disables the check entirely.
        let stale = store
            .find_stale(Duration::ZERO, Duration::from_secs(60), later)
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn retention_only_deletes_old_succeeded_rows() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let old = store
            .enqueue(NewJob::new(payload("old")).run_at(now))
            .unwrap();
        let young = store
            .enqueue(NewJob::new(payload("young")).run_at(now))
            .unwrap();
        let failed = store
            .enqueue(NewJob::new(payload("failed")).run_at(now))
            .unwrap();

        store.claim_batch(&[], 3, &performer("p"), now).unwrap();
        for id in [old, young, failed] {
            store.mark_running(id, &performer("w"), now).unwrap();
        }
        store
            .mark_succeeded(old, now - chrono::Duration::days(30))
            .unwrap();
        store.mark_succeeded(young, now).unwrap();
        store.mark_failed(failed, "nope", now).unwrap();

        let deleted = store
            .delete_succeeded_before(now - chrono::Duration::days(14))
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(old).unwrap().is_none());
        assert!(store.get(young).unwrap().is_some());
        assert!(store.get(failed).unwrap().is_some());
    }

    #[test]
    fn global_lock_times_out_while_held() {
        let store = Arc::new(InMemoryJobStore::new());

        let holder = store.clone();
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let guard = std::thread::spawn(move || {
            holder
                .with_global_lock(Duration::from_secs(1), &mut || {
                    held_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                })
                .unwrap()
        });

        held_rx.recv().unwrap();
        let outcome = store
            .with_global_lock(Duration::from_millis(50), &mut || {
                panic!("body must not run on timeout")
            })
            .unwrap();
        assert_eq!(outcome, LockOutcome::TimedOut);

        release_tx.send(()).unwrap();
        assert_eq!(guard.join().unwrap(), LockOutcome::Acquired);
    }
}
