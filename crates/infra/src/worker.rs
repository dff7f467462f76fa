//! Per-job execution protocol.
//!
//! A worker takes a claimed job through `locked → running → terminal`.
//! Handler failures (including panics) are converted to row state plus an
//! exception-callback invocation; they never propagate out of [`run_one`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};

use drayhorse_core::{
    EngineConfig, EngineError, HandlerError, HandlerRegistry, JobId, JobPayload, JobRecord,
    PerformContext, PerformerId,
};

use crate::store::JobStore;

/// Execute one claimed job to a terminal state. Never returns an error:
/// every failure mode ends in row state and/or the exception callback.
pub fn run_one(
    store: &Arc<dyn JobStore>,
    registry: &HandlerRegistry,
    config: &EngineConfig,
    performer: &PerformerId,
    id: JobId,
) {
    let now = Utc::now();
    let record = match store.mark_running(id, performer, now) {
        Ok(record) => record,
        Err(err) => {
            // Claim was reset or cleaned between dispatch and start.
            warn!(job_id = %id, error = %err, "claimed job no longer runnable");
            return;
        }
    };

    debug!(job_id = %id, queue = %record.queue, performer = %performer, "job started");

    let failure = match prepare(registry, &record) {
        Err(err) => Some(err),
        Ok((payload, handler)) => {
            if config.perform_jobs_in_tx {
                perform_in_tx(store, &*handler, &payload, &record, performer)
            } else {
                let mut ctx = PerformContext {
                    job_id: id,
                    queue: &record.queue,
                    performer,
                    tx: None,
                };
                match invoke(&*handler, &payload.args, &mut ctx) {
                    Ok(()) => finalize_success(store, id),
                    Err(err) => Some(err),
                }
            }
        }
    };

    match failure {
        None => {
            debug!(job_id = %id, "job succeeded");
        }
        Some(err) => {
            if let Err(store_err) = store.mark_failed(id, &err.detail(), Utc::now()) {
                error!(job_id = %id, error = %store_err, "failed to record job failure");
            }
            warn!(job_id = %id, error = %err, "job failed");
            config.report_exception(&EngineError::HandlerFailed { id, error: err });
        }
    }
}

/// Decode the payload envelope and resolve its handler.
fn prepare(
    registry: &HandlerRegistry,
    record: &JobRecord,
) -> Result<(JobPayload, Arc<dyn drayhorse_core::JobHandler>), HandlerError> {
    let payload =
        JobPayload::from_value(&record.payload).map_err(|e| HandlerError::new(e.to_string()))?;
    let handler = registry
        .resolve(&payload.handler)
        .map_err(|e| HandlerError::new(e.to_string()))?;
    Ok((payload, handler))
}

/// Handler body plus the `succeeded` finalization in one storage
/// transaction: an error rolls back both, and `failed` is recorded in a
/// separate transaction by the caller.
fn perform_in_tx(
    store: &Arc<dyn JobStore>,
    handler: &dyn drayhorse_core::JobHandler,
    payload: &JobPayload,
    record: &JobRecord,
    performer: &PerformerId,
) -> Option<HandlerError> {
    let outcome = store.transactionally(&mut |uow| {
        let mut ctx = PerformContext {
            job_id: record.id,
            queue: &record.queue,
            performer,
            tx: Some(uow.as_ambient()),
        };
        invoke(handler, &payload.args, &mut ctx)?;
        uow.mark_succeeded(record.id, Utc::now())
            .map_err(|e| HandlerError::new(e.to_string()))
    });

    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(handler_err)) => Some(handler_err),
        Err(store_err) => Some(HandlerError::new(store_err.to_string())),
    }
}

fn finalize_success(store: &Arc<dyn JobStore>, id: JobId) -> Option<HandlerError> {
    match store.mark_succeeded(id, Utc::now()) {
        Ok(()) => None,
        Err(err) => Some(HandlerError::new(err.to_string())),
    }
}

/// Invoke a handler, converting panics into handler errors so a misbehaving
/// job cannot take down the pool.
fn invoke(
    handler: &dyn drayhorse_core::JobHandler,
    args: &serde_json::Value,
    ctx: &mut PerformContext<'_>,
) -> Result<(), HandlerError> {
    catch_unwind(AssertUnwindSafe(|| handler.perform(args, ctx)))
        .unwrap_or_else(|panic| Err(HandlerError::new(panic_message(panic))))
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_string()
    }
}
