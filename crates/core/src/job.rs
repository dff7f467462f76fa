//! Job records and their lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the process/thread holding or executing a claim.
///
/// Recorded in `locked_by` and passed explicitly into handler invocations
/// instead of being looked up through thread-local state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerformerId(pub String);

impl PerformerId {
    /// Build a performer id from host name, process id and a worker index.
    pub fn new(host: impl Into<String>, pid: u32, worker: usize) -> Self {
        Self(format!("{}.{}.{}", host.into(), pid, worker))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PerformerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle state.
///
/// States only move forward: `waiting → locked → running → {succeeded |
/// failed}`. `locked` means "claimed, not yet started"; `running` means
/// execution is in progress. A `failed` row may be manually reset to
/// `waiting`, which is the only backward edge and an operator action,
/// never something the engine does on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Enqueued, eligible once `run_at` has passed.
    Waiting,
    /// Claimed by a poller, not yet started.
    Locked,
    /// Handler execution in progress.
    Running,
    /// Terminal: handler returned normally.
    Succeeded,
    /// Terminal: handler raised; see `last_error`.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Forward transitions of the lifecycle. `Failed → Waiting` is the
    /// manual-reset edge and is allowed here so the store can express it.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Waiting, JobState::Locked)
                | (JobState::Locked, JobState::Running)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
                | (JobState::Failed, JobState::Waiting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Locked => "locked",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "locked" => Some(JobState::Locked),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default queue name used when the enqueuer does not specify one.
pub const DEFAULT_QUEUE: &str = "default";

/// A persisted unit of work and its lifecycle bookkeeping.
///
/// The engine never interprets `payload` beyond handing it to the registered
/// handler; it is an opaque serialized handler description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Logical partition; pollers may filter by queue.
    pub queue: String,
    /// Lower value is claimed first; ties break on `run_at`, then `id`.
    pub priority: i32,
    /// Opaque handler description (handler name + arguments).
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Earliest eligible execution time.
    pub run_at: DateTime<Utc>,
    /// Set while a claim is held; cleared on terminal transition.
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<PerformerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure detail (message + backtrace) when `state = failed`.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// True once `run_at` has passed relative to `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }
}

/// Description of a job to insert, produced by the enqueue API.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    /// A job on the default queue with default priority, runnable now.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            priority: 0,
            payload,
            run_at: Utc::now(),
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Defer execution until `at`.
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = at;
        self
    }

    /// Materialize a `waiting` record with fresh bookkeeping fields.
    pub fn into_record(self, now: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: JobId::new(),
            queue: self.queue,
            priority: self.priority,
            payload: self.payload,
            state: JobState::Waiting,
            run_at: self.run_at,
            locked_at: None,
            locked_by: None,
            started_at: None,
            finished_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
