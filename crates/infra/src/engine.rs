//! Engine lifecycle.
//!
//! [`Engine::start`] wires the poller and worker pool together and returns a
//! handle that owns both. Shutdown is cooperative: the poller stops claiming,
//! the pool drains in-flight handlers, and only then do threads join.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use drayhorse_core::{EngineConfig, EngineError, EngineResult, HandlerRegistry};

use crate::pool::{Wakeup, WorkerPool};
use crate::poller::Poller;
use crate::store::JobStore;

pub struct Engine {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn JobStore>, registry: HandlerRegistry, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Spawn the worker pool and the poller thread.
    pub fn start(self) -> EngineHandle {
        let wakeup = Arc::new(Wakeup::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let pool = Arc::new(WorkerPool::spawn(
            self.store.clone(),
            self.registry,
            self.config.clone(),
            wakeup.clone(),
        ));

        let poller = Poller::new(
            self.store,
            self.config,
            pool.clone(),
            wakeup.clone(),
            shutdown.clone(),
        );
        let poller_thread = thread::Builder::new()
            .name("drayhorse-poller".to_string())
            .spawn(move || poller.run())
            .expect("failed to spawn poller thread");

        info!("engine started");

        EngineHandle {
            pool,
            wakeup,
            shutdown,
            poller: Some(poller_thread),
        }
    }
}

/// Cloneable switch that signal handlers use to request a stop.
#[derive(Clone)]
pub struct ShutdownTrigger {
    shutdown: Arc<AtomicBool>,
    wakeup: Arc<Wakeup>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup.notify();
    }
}

/// Owner of the running engine's threads.
pub struct EngineHandle {
    pool: Arc<WorkerPool>,
    wakeup: Arc<Wakeup>,
    shutdown: Arc<AtomicBool>,
    poller: Option<thread::JoinHandle<EngineResult<()>>>,
}

impl EngineHandle {
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            shutdown: self.shutdown.clone(),
            wakeup: self.wakeup.clone(),
        }
    }

    /// Request a stop and wait for the drain.
    pub fn shutdown(self, drain_timeout: Duration) -> EngineResult<()> {
        self.shutdown_trigger().trigger();
        self.join(drain_timeout)
    }

    /// Block until the poller exits (shutdown request or fatal error), then
    /// drain the pool. The poller's verdict is the engine's verdict; an
    /// incomplete drain is logged but does not mask it.
    pub fn join(mut self, drain_timeout: Duration) -> EngineResult<()> {
        let verdict = match self.poller.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(EngineError::storage("poller thread panicked")),
            },
            None => Ok(()),
        };

        if !self.pool.drain_and_stop(drain_timeout) {
            error!("worker pool did not drain before timeout");
        }
        info!("engine stopped");
        verdict
    }
}
