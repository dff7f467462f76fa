//! Poll loop: scan-and-claim under the global lock, dispatch to the pool.
//!
//! Exactly one poller cluster-wide makes progress per cycle: the claim scan
//! runs while holding the cross-process advisory lock, so two processes
//! never race past each other's conditional updates in bulk. Consecutive
//! acquisition timeouts are tolerated up to `max_global_lock_fails`; past
//! that the poller assumes the lock holder is wedged and exits fatally so a
//! supervisor can restart the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use drayhorse_core::{EngineConfig, EngineError, EngineResult, JobId, PerformerId};

use crate::pool::{Wakeup, WorkerPool};
use crate::store::{JobStore, LockOutcome, StoreError};

pub struct Poller {
    store: Arc<dyn JobStore>,
    config: EngineConfig,
    pool: Arc<WorkerPool>,
    wakeup: Arc<Wakeup>,
    shutdown: Arc<AtomicBool>,
    claimant: PerformerId,
}

impl Poller {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: EngineConfig,
        pool: Arc<WorkerPool>,
        wakeup: Arc<Wakeup>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let claimant = PerformerId(format!("{host}.{}.poller", std::process::id()));
        Self {
            store,
            config,
            pool,
            wakeup,
            shutdown,
            claimant,
        }
    }

    /// Run poll cycles until shutdown is requested or a fatal condition
    /// occurs. Non-fatal errors are logged, reported and retried on the
    /// next cycle.
    pub fn run(&self) -> EngineResult<()> {
        if self.config.clean_stuck_jobs {
            let reset = self.store.clean_stuck_jobs().map_err(EngineError::from)?;
            if reset > 0 {
                warn!(reset, "reset stuck jobs left behind by a previous process");
            }
        }

        info!(
            queues = ?self.config.queues,
            poll_interval = ?self.config.poll_interval,
            "poller started"
        );

        let mut consecutive_lock_fails = 0u32;
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.poll_cycle(&mut consecutive_lock_fails) {
                Ok(dispatched) => {
                    if dispatched == 0 {
                        self.wakeup.wait_timeout(self.config.poll_interval);
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "poller terminating");
                    if !self.config.silence_poller_exceptions {
                        self.config.report_exception(&err);
                    }
                    return Err(err);
                }
                Err(err) => {
                    error!(error = %err, "poll cycle failed");
                    if !self.config.silence_poller_exceptions {
                        self.config.report_exception(&err);
                    }
                    self.wakeup.wait_timeout(self.config.poll_interval);
                }
            }
        }

        info!("poller stopped");
        Ok(())
    }

    /// One cycle: claim up to the pool's idle capacity under the global
    /// lock, then dispatch outside it. Returns how many jobs were
    /// dispatched.
    pub fn poll_cycle(&self, consecutive_lock_fails: &mut u32) -> EngineResult<usize> {
        let capacity = self.pool.capacity();
        if capacity == 0 {
            debug!("pool saturated, skipping claim scan");
            return Ok(0);
        }

        let mut scan: Result<Vec<JobId>, StoreError> = Ok(Vec::new());
        let outcome = self
            .store
            .with_global_lock(self.config.global_lock_timeout, &mut || {
                scan = self.store.claim_batch(
                    &self.config.queues,
                    capacity,
                    &self.claimant,
                    Utc::now(),
                );
            })
            .map_err(EngineError::from)?;

        match outcome {
            LockOutcome::TimedOut => {
                *consecutive_lock_fails += 1;
                if *consecutive_lock_fails >= self.config.max_global_lock_fails {
                    return Err(EngineError::GlobalLockExhausted {
                        fails: *consecutive_lock_fails,
                    });
                }
                warn!(
                    fails = *consecutive_lock_fails,
                    max = self.config.max_global_lock_fails,
                    "global lock acquisition timed out"
                );
                Ok(0)
            }
            LockOutcome::Acquired => {
                *consecutive_lock_fails = 0;
                let claimed = scan.map_err(EngineError::from)?;
                let mut dispatched = 0;
                for id in claimed {
                    if self.pool.dispatch(id) {
                        dispatched += 1;
                    }
                }
                if dispatched > 0 {
                    debug!(dispatched, "poll cycle dispatched jobs");
                }
                Ok(dispatched)
            }
        }
    }
}
