//! `drayhorse-core` — queue-engine foundation building blocks.
//!
//! This crate contains the **pure domain** of the job queue (records, state
//! machine, configuration, errors, handler contract). No storage or process
//! concerns live here.

pub mod config;
pub mod error;
pub mod handler;
pub mod job;

pub use config::{EngineConfig, ExceptionCallback};
pub use error::{EngineError, EngineResult, HandlerError};
pub use handler::{AmbientTx, HandlerRegistry, JobHandler, JobPayload, PerformContext};
pub use job::{DEFAULT_QUEUE, JobId, JobRecord, JobState, NewJob, PerformerId};
