//! Engine error taxonomy.

use thiserror::Error;

use crate::job::{JobId, JobState};

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure raised by a job handler.
///
/// Handler failures are job-level: they are recorded on the row and reported
/// through the exception callback, and never crash the worker process.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Captured backtrace/context lines, if any.
    pub backtrace: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: None,
        }
    }

    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = Some(backtrace.into());
        self
    }

    /// Row representation stored in `last_error`.
    pub fn detail(&self) -> String {
        match &self.backtrace {
            Some(bt) => format!("{}\n{}", self.message, bt),
            None => self.message.clone(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Engine-level error.
///
/// Claim races are deliberately absent: losing a conditional update is benign
/// and surfaces as a skipped row, not an error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage failure (connection loss, constraint violation, bad row).
    #[error("storage error: {0}")]
    Storage(String),

    /// A row was not in the state an operation required.
    #[error("job {id} is {actual}, expected {expected}")]
    UnexpectedState {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },

    /// A referenced job does not exist.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The payload named a handler no one registered.
    #[error("no handler registered for '{0}'")]
    UnknownHandler(String),

    /// The payload envelope was malformed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Fatal: the global lock could not be acquired
    /// `max_global_lock_fails` times in a row.
    #[error("global lock acquisition failed {fails} consecutive times")]
    GlobalLockExhausted { fails: u32 },

    /// Operator-facing stale-job signal; never auto-remediated.
    #[error("{count} stale job(s) detected: {detail}")]
    StaleJobs { count: usize, detail: String },

    /// A handler failed; carried to the exception callback.
    #[error("job {id} failed: {error}")]
    HandlerFailed { id: JobId, error: HandlerError },
}

impl EngineError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True for conditions that must terminate the poller process and rely
    /// on the supervisor to restart it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::GlobalLockExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_detail_includes_backtrace() {
        let plain = HandlerError::new("boom");
        assert_eq!(plain.detail(), "boom");

        let with_bt = HandlerError::new("boom").with_backtrace("at worker.rs:42");
        assert_eq!(with_bt.detail(), "boom\nat worker.rs:42");
    }

    #[test]
    fn only_lock_exhaustion_is_fatal() {
        assert!(EngineError::GlobalLockExhausted { fails: 10 }.is_fatal());
        assert!(!EngineError::storage("db gone").is_fatal());
        assert!(
            !EngineError::StaleJobs {
                count: 1,
                detail: "job x".into()
            }
            .is_fatal()
        );
    }
}
