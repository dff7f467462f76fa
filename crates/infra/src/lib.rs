//! Infrastructure layer: job storage, locking, polling and execution.

pub mod engine;
pub mod enqueue;
pub mod maintenance;
pub mod poller;
pub mod pool;
pub mod stale;
pub mod store;
pub mod worker;

pub use engine::{Engine, EngineHandle, ShutdownTrigger};
pub use enqueue::Enqueuer;
pub use maintenance::register_maintenance_handlers;
pub use poller::Poller;
pub use pool::{Wakeup, WorkerPool};
pub use stale::StaleJobDetector;
pub use store::{
    InMemoryJobStore, JobCounts, JobStore, LockOutcome, PostgresJobStore, StoreError, UnitOfWork,
};
