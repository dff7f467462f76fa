//! Postgres-backed job store.
//!
//! All lifecycle transitions are conditional updates keyed on the current
//! state, so the affected-row count detects claim races without row locks.
//! The global lock is a session-scoped advisory lock
//! (`pg_try_advisory_lock`) held on a dedicated pooled connection for the
//! duration of the scan-and-claim phase.
//!
//! The store presents a synchronous facade over sqlx: it owns a tokio
//! runtime [`Handle`] and bridges with `block_on`. Call it from plain
//! threads (workers, pollers), never from inside the runtime itself.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;

use drayhorse_core::{
    AmbientTx, HandlerError, JobId, JobRecord, JobState, NewJob, PerformerId,
};

use super::{JobCounts, JobStore, LockOutcome, StoreError, TxBody, UnitOfWork};

/// Advisory lock key shared by every poller in the fleet
/// (ascii "drayhors" as a big-endian i64).
const GLOBAL_LOCK_KEY: i64 = 0x6472_6179_686f_7273;

/// Poll interval while waiting on the advisory lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const SCHEMA: &str = include_str!("schema.sql");

const JOB_COLUMNS: &str = "id, queue, priority, payload, state, run_at, locked_at, locked_by, \
     started_at, finished_at, last_error, created_at, updated_at";

/// Postgres job store over a sqlx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresJobStore {
    /// Wrap an existing pool. `handle` is the runtime the store bridges
    /// into; the calling thread must not be a runtime worker.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Apply the job table schema (idempotent).
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.handle
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    fn fetch_record(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = self
            .handle
            .block_on(
                sqlx::query(&query)
                    .bind(id.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_record(&r)).transpose()
    }

    /// Report the actual state of a row after a conditional update matched
    /// nothing.
    fn state_conflict(&self, id: JobId, expected: JobState) -> StoreError {
        match self.fetch_record(id) {
            Ok(Some(record)) => StoreError::UnexpectedState {
                id,
                expected,
                actual: record.state,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(err) => err,
        }
    }
}

impl JobStore for PostgresJobStore {
    fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        let record = job.into_record(Utc::now());
        let id = record.id;

        self.handle
            .block_on(insert_job_query(&record).execute(&self.pool))
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(id)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.fetch_record(id)
    }

    fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = $1 ORDER BY created_at, id LIMIT $2"
        );
        let rows = self
            .handle
            .block_on(
                sqlx::query(&query)
                    .bind(state.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("list_by_state", e))?;

        rows.iter().map(decode_record).collect()
    }

    fn counts(&self) -> Result<JobCounts, StoreError> {
        let rows = self
            .handle
            .block_on(
                sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row
                .try_get("state")
                .map_err(|e| StoreError::backend(e.to_string()))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| StoreError::backend(e.to_string()))?;
            match JobState::parse(&state) {
                Some(JobState::Waiting) => counts.waiting = n as u64,
                Some(JobState::Locked) => counts.locked = n as u64,
                Some(JobState::Running) => counts.running = n as u64,
                Some(JobState::Succeeded) => counts.succeeded = n as u64,
                Some(JobState::Failed) => counts.failed = n as u64,
                None => return Err(StoreError::backend(format!("unknown state '{state}'"))),
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

        self.handle.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT id
                FROM jobs
                WHERE state = 'waiting'
                  AND run_at <= $1
                  AND (cardinality($2::text[]) = 0 OR queue = ANY($2))
                ORDER BY priority ASC, run_at ASC, id ASC
                LIMIT $3
                "#,
            )
            .bind(now)
            .bind(queues)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_scan", e))?;

            let mut claimed = Vec::with_capacity(rows.len());
            for row in rows {
                let id: uuid::Uuid = row
                    .try_get("id")
                    .map_err(|e| StoreError::backend(e.to_string()))?;

                // Compare-and-swap on (id, state); zero rows means another
                // claimant won and the row is skipped.
                let result = sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'locked', locked_at = $2, locked_by = $3, updated_at = $2
                    WHERE id = $1 AND state = 'waiting'
                    "#,
                )
                .bind(id)
                .bind(now)
                .bind(locked_by.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("claim_update", e))?;

                if result.rows_affected() == 1 {
                    claimed.push(JobId::from_uuid(id));
                }
            }

            Ok(claimed)
        })
    }

    fn mark_running(
        &self,
        id: JobId,
        performer: &PerformerId,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        let query = format!(
            "UPDATE jobs \
             SET state = 'running', started_at = $2, locked_by = $3, updated_at = $2 \
             WHERE id = $1 AND state = 'locked' \
             RETURNING {JOB_COLUMNS}"
        );
        let row = self
            .handle
            .block_on(
                sqlx::query(&query)
                    .bind(id.as_uuid())
                    .bind(now)
                    .bind(performer.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("mark_running", e))?;

        match row {
            Some(row) => decode_record(&row),
            None => Err(self.state_conflict(id, JobState::Locked)),
        }
    }

    fn mark_succeeded(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = self
            .handle
            .block_on(mark_succeeded_query(id, now).execute(&self.pool))
            .map_err(|e| map_sqlx_error("mark_succeeded", e))?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.state_conflict(id, JobState::Running))
        }
    }

    fn mark_failed(&self, id: JobId, error: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'failed', last_error = $2, finished_at = $3,
                        locked_at = NULL, locked_by = NULL, updated_at = $3
                    WHERE id = $1 AND state = 'running'
                    "#,
                )
                .bind(id.as_uuid())
                .bind(error)
                .bind(now)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.state_conflict(id, JobState::Running))
        }
    }

    fn reset_failed(&self, id: JobId) -> Result<(), StoreError> {
        let result = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'waiting', started_at = NULL, finished_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND state = 'failed'
                    "#,
                )
                .bind(id.as_uuid())
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("reset_failed", e))?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.state_conflict(id, JobState::Failed))
        }
    }

    fn clean_stuck_jobs(&self) -> Result<u64, StoreError> {
        let result = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'waiting', locked_at = NULL, locked_by = NULL,
                        started_at = NULL, updated_at = NOW()
                    WHERE state IN ('locked', 'running')
                    "#,
                )
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("clean_stuck_jobs", e))?;

        Ok(result.rows_affected())
    }

    fn find_stale(
        &self,
        locked_threshold: Duration,
        running_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let locked_cutoff = threshold_cutoff(locked_threshold, now);
        let running_cutoff = threshold_cutoff(running_threshold, now);

        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (state = 'locked' AND $1::timestamptz IS NOT NULL AND locked_at < $1) \
                OR (state = 'running' AND $2::timestamptz IS NOT NULL AND started_at < $2) \
             ORDER BY created_at, id"
        );
        let rows = self
            .handle
            .block_on(
                sqlx::query(&query)
                    .bind(locked_cutoff)
                    .bind(running_cutoff)
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("find_stale", e))?;

        rows.iter().map(decode_record).collect()
    }

    fn delete_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = self
            .handle
            .block_on(
                sqlx::query("DELETE FROM jobs WHERE state = 'succeeded' AND finished_at < $1")
                    .bind(cutoff)
                    .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("delete_succeeded_before", e))?;

        Ok(result.rows_affected())
    }

    fn transactionally(&self, body: TxBody<'_>) -> Result<Result<(), HandlerError>, StoreError> {
        let tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin", e))?;

        let mut uow = PgUnitOfWork {
            handle: self.handle.clone(),
            tx: Some(tx),
        };

        let outcome = body(&mut uow);
        let tx = uow
            .tx
            .take()
            .ok_or_else(|| StoreError::backend("transaction consumed by handler"))?;

        match outcome {
            Ok(()) => {
                self.handle
                    .block_on(tx.commit())
                    .map_err(|e| map_sqlx_error("commit", e))?;
                Ok(Ok(()))
            }
            Err(err) => {
                self.handle
                    .block_on(tx.rollback())
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                Ok(Err(err))
            }
        }
    }

    fn with_global_lock(
        &self,
        timeout: Duration,
        body: &mut dyn FnMut(),
    ) -> Result<LockOutcome, StoreError> {
        // Acquire on a dedicated connection; advisory locks are
        // session-scoped, so the same session must release it.
        let deadline = Instant::now() + timeout;
        let conn = self.handle.block_on(async {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| map_sqlx_error("lock_acquire_conn", e))?;

            loop {
                let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
                    .bind(GLOBAL_LOCK_KEY)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(|e| map_sqlx_error("lock_try", e))?;
                let acquired: bool = row
                    .try_get("acquired")
                    .map_err(|e| StoreError::backend(e.to_string()))?;

                if acquired {
                    return Ok(Some(conn));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
            }
        })?;

        let Some(mut conn) = conn else {
            return Ok(LockOutcome::TimedOut);
        };

        // Body runs on the calling thread, outside any runtime context, so
        // it may itself re-enter the store. An unwinding body must still
        // release the lock: the session goes back to the pool and would
        // otherwise keep the advisory lock held for its lifetime.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body()));

        let unlock = self.handle.block_on(
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(GLOBAL_LOCK_KEY)
                .execute(&mut *conn),
        );
        if unlock.is_err() {
            // Closing the session releases the lock even when the unlock
            // call itself failed.
            let raw = conn.detach();
            let _ = self.handle.block_on(sqlx::Connection::close(raw));
        }

        if let Err(panic) = outcome {
            std::panic::resume_unwind(panic);
        }
        Ok(LockOutcome::Acquired)
    }
}

/// Unit of work over a live Postgres transaction.
///
/// Handlers running with `perform_jobs_in_tx` can downcast the
/// [`AmbientTx`] to this type (via `as_any`) to issue their own SQL on the
/// same transaction.
pub struct PgUnitOfWork {
    handle: Handle,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUnitOfWork {
    /// The live transaction, for handler-issued SQL.
    pub fn sql_tx(&mut self) -> &mut Transaction<'static, Postgres> {
        self.tx.as_mut().expect("transaction already finished")
    }
}

impl UnitOfWork for PgUnitOfWork {
    fn insert_job(&mut self, job: NewJob) -> Result<JobId, StoreError> {
        let record = job.into_record(Utc::now());
        let id = record.id;
        let handle = self.handle.clone();
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::backend("transaction already finished"))?;

        handle
            .block_on(insert_job_query(&record).execute(&mut **tx))
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(id)
    }

    fn mark_succeeded(&mut self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let handle = self.handle.clone();
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::backend("transaction already finished"))?;

        let result = handle
            .block_on(mark_succeeded_query(id, now).execute(&mut **tx))
            .map_err(|e| map_sqlx_error("mark_succeeded", e))?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    fn as_ambient(&mut self) -> &mut dyn AmbientTx {
        self
    }
}

impl AmbientTx for PgUnitOfWork {
    fn enqueue(&mut self, job: NewJob) -> Result<JobId, HandlerError> {
        self.insert_job(job)
            .map_err(|e| HandlerError::new(e.to_string()))
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn insert_job_query(record: &JobRecord) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, queue, priority, payload, state, run_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'waiting', $5, $6, $6)
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(&record.queue)
    .bind(record.priority)
    .bind(&record.payload)
    .bind(record.run_at)
    .bind(record.created_at)
}

fn mark_succeeded_query(
    id: JobId,
    now: DateTime<Utc>,
) -> sqlx::query::Query<'static, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET state = 'succeeded', finished_at = $2,
            locked_at = NULL, locked_by = NULL, updated_at = $2
        WHERE id = $1 AND state = 'running'
        "#,
    )
    .bind(*id.as_uuid())
    .bind(now)
}

fn threshold_cutoff(threshold: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if threshold.is_zero() {
        return None;
    }
    chrono::Duration::from_std(threshold).ok().map(|d| now - d)
}

/// Map sqlx errors, attaching the failing operation.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::backend(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::backend(format!("connection pool closed in {operation}"))
        }
        other => StoreError::backend(format!("sqlx error in {operation}: {other}")),
    }
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    queue: String,
    priority: i32,
    payload: serde_json::Value,
    state: String,
    run_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            priority: row.try_get("priority")?,
            payload: row.try_get("payload")?,
            state: row.try_get("state")?,
            run_at: row.try_get("run_at")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn decode_record(row: &PgRow) -> Result<JobRecord, StoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| StoreError::backend(format!("failed to decode job row: {e}")))?;
    let state = JobState::parse(&row.state)
        .ok_or_else(|| StoreError::backend(format!("unknown job state '{}'", row.state)))?;

    Ok(JobRecord {
        id: JobId::from_uuid(row.id),
        queue: row.queue,
        priority: row.priority,
        payload: row.payload,
        state,
        run_at: row.run_at,
        locked_at: row.locked_at,
        locked_by: row.locked_by.map(PerformerId),
        started_at: row.started_at,
        finished_at: row.finished_at,
        last_error: row.last_error,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
