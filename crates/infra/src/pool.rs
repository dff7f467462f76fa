//! Bounded worker pool.
//!
//! A fixed set of execution threads consumes claimed job ids from an
//! in-process channel, decoupled from the database. The pool tracks
//! in-flight work so the poller can size its claim batches, and supports a
//! cooperative drain that stops accepting dispatches but waits for running
//! handlers to finish.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use drayhorse_core::{EngineConfig, HandlerRegistry, JobId, PerformerId};

use crate::store::JobStore;
use crate::worker;

/// Condvar-backed wakeup shared by the pool and its poller: workers signal
/// when capacity frees up, shutdown signals to interrupt the poll sleep.
#[derive(Debug, Default)]
pub struct Wakeup {
    state: Mutex<u64>,
    condvar: Condvar,
}

impl Wakeup {
    pub fn notify(&self) {
        let mut generation = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *generation += 1;
        self.condvar.notify_all();
    }

    /// Sleep until notified or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) {
        let generation = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let seen = *generation;
        let _unused = self
            .condvar
            .wait_timeout_while(generation, timeout, |g| *g == seen)
            .unwrap_or_else(|e| e.into_inner());
    }
}

/// Fixed-size pool of worker threads. Shared behind an `Arc` between the
/// engine handle and the poller thread.
pub struct WorkerPool {
    size: usize,
    inflight: Arc<AtomicUsize>,
    wakeup: Arc<Wakeup>,
    sender: Mutex<Option<Sender<JobId>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `config.pool_size` worker threads servicing the internal
    /// queue.
    pub fn spawn(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        config: EngineConfig,
        wakeup: Arc<Wakeup>,
    ) -> Self {
        let (sender, receiver) = channel::<JobId>();
        let receiver = Arc::new(Mutex::new(receiver));
        let inflight = Arc::new(AtomicUsize::new(0));
        let host = default_host();
        let pid = std::process::id();

        let workers = (0..config.pool_size)
            .map(|index| {
                let store = store.clone();
                let registry = registry.clone();
                let config = config.clone();
                let receiver = receiver.clone();
                let inflight = inflight.clone();
                let wakeup = wakeup.clone();
                let performer = PerformerId::new(host.clone(), pid, index);

                thread::Builder::new()
                    .name(format!("drayhorse-worker-{index}"))
                    .spawn(move || {
                        worker_loop(store, registry, config, receiver, inflight, wakeup, performer)
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(pool_size = config.pool_size, "worker pool started");

        Self {
            size: config.pool_size,
            inflight,
            wakeup,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Idle capacity: pool size minus dispatched-but-unfinished jobs.
    /// This is the claim-batch limit for the next poll cycle.
    pub fn capacity(&self) -> usize {
        self.size
            .saturating_sub(self.inflight.load(Ordering::SeqCst))
    }

    /// Hand a claimed job to an idle worker. Returns `false` once the pool
    /// is draining.
    pub fn dispatch(&self, id: JobId) -> bool {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if sender.send(id).is_err() {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        debug!(job_id = %id, "job dispatched to pool");
        true
    }

    /// Stop accepting dispatches and wait up to `timeout` for in-flight
    /// jobs to finish. Returns whether the pool fully drained; worker
    /// threads are joined only on a clean drain, and handlers are never
    /// force-killed.
    pub fn drain_and_stop(&self, timeout: Duration) -> bool {
        // Dropping the sender disconnects the channel; workers exit after
        // finishing whatever is already queued or running.
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.wakeup.notify();

        let deadline = Instant::now() + timeout;
        while self.inflight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                info!(
                    inflight = self.inflight.load(Ordering::SeqCst),
                    "drain timeout reached with jobs still in flight"
                );
                return false;
            }
            self.wakeup.wait_timeout(Duration::from_millis(20));
        }

        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            let _ = handle.join();
        }
        info!("worker pool drained");
        true
    }
}

fn worker_loop(
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: EngineConfig,
    receiver: Arc<Mutex<Receiver<JobId>>>,
    inflight: Arc<AtomicUsize>,
    wakeup: Arc<Wakeup>,
    performer: PerformerId,
) {
    loop {
        let message = {
            let receiver = receiver.lock().unwrap_or_else(|e| e.into_inner());
            receiver.recv_timeout(Duration::from_millis(100))
        };

        match message {
            Ok(id) => {
                worker::run_one(&store, &registry, &config, &performer, id);
                inflight.fetch_sub(1, Ordering::SeqCst);
                // Capacity freed: wake the poller early.
                wakeup.notify();
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn default_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::store::{InMemoryJobStore, JobStore};
    use chrono::Utc;
    use drayhorse_core::{JobPayload, JobState, NewJob, PerformContext};

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    fn claimed(store: &Arc<dyn JobStore>, handler: &str) -> JobId {
        let id = store
            .enqueue(NewJob::new(
                JobPayload::new(handler, serde_json::json!({})).into_value(),
            ))
            .unwrap();
        store
            .claim_batch(&[], 1, &PerformerId("pool-test".into()), Utc::now())
            .unwrap();
        id
    }

    #[test]
    fn dispatched_jobs_execute() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register("ok", |_: &serde_json::Value, _: &mut PerformContext<'_>| Ok(()));

        let config = EngineConfig::default().with_pool_size(2);
        let pool = WorkerPool::spawn(
            store.clone(),
            registry,
            config,
            Arc::new(Wakeup::default()),
        );

        let id = claimed(&store, "ok");
        assert!(pool.dispatch(id));

        assert!(wait_until(Duration::from_secs(2), || {
            store.get(id).unwrap().unwrap().state == JobState::Succeeded
        }));
        assert!(pool.drain_and_stop(Duration::from_secs(2)));
    }

    #[test]
    fn capacity_reflects_inflight_work() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let gate_handler = gate.clone();

        let mut registry = HandlerRegistry::new();
        registry.register("block", move |_: &serde_json::Value, _: &mut PerformContext<'_>| {
            let (lock, condvar) = &*gate_handler;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = condvar.wait(released).unwrap();
            }
            Ok(())
        });

        let config = EngineConfig::default().with_pool_size(2);
        let pool = WorkerPool::spawn(
            store.clone(),
            registry,
            config,
            Arc::new(Wakeup::default()),
        );
        assert_eq!(pool.capacity(), 2);

        let id = claimed(&store, "block");
        pool.dispatch(id);
        assert!(wait_until(Duration::from_secs(1), || pool.capacity() == 1));

        // Release the handler; capacity returns.
        {
            let (lock, condvar) = &*gate;
            *lock.lock().unwrap() = true;
            condvar.notify_all();
        }
        assert!(wait_until(Duration::from_secs(2), || pool.capacity() == 2));
        assert!(pool.drain_and_stop(Duration::from_secs(2)));
    }

    #[test]
    fn drain_waits_for_inflight_jobs() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        static COMPLETED: AtomicUsize = AtomicUsize::new(0);

        let mut registry = HandlerRegistry::new();
        registry.register("slow", |_: &serde_json::Value, _: &mut PerformContext<'_>| {
            thread::sleep(Duration::from_millis(200));
            COMPLETED.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let config = EngineConfig::default().with_pool_size(1);
        let pool = WorkerPool::spawn(
            store.clone(),
            registry,
            config,
            Arc::new(Wakeup::default()),
        );

        let id = claimed(&store, "slow");
        pool.dispatch(id);
        thread::sleep(Duration::from_millis(50));

        assert!(pool.drain_and_stop(Duration::from_secs(5)));
        assert_eq!(COMPLETED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_after_drain_is_refused() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register("ok", |_: &serde_json::Value, _: &mut PerformContext<'_>| Ok(()));

        let config = EngineConfig::default().with_pool_size(1);
        let pool = WorkerPool::spawn(
            store.clone(),
            registry,
            config,
            Arc::new(Wakeup::default()),
        );

        assert!(pool.drain_and_stop(Duration::from_secs(1)));

        let id = claimed(&store, "ok");
        assert!(!pool.dispatch(id));
        assert_eq!(pool.capacity(), 1);
    }
}
