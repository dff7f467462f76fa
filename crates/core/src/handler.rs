//! Handler contract and routing.
//!
//! A job payload is an opaque envelope naming a handler plus its arguments.
//! The engine resolves the handler through a registry and invokes it with an
//! explicit [`PerformContext`] carrying the performer identity (no
//! thread-local lookup).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, HandlerError};
use crate::job::{JobId, NewJob, PerformerId};

/// Serialized handler description carried in `JobRecord::payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    /// Registry key of the handler to invoke.
    pub handler: String,
    /// Handler arguments, opaque to the engine.
    #[serde(default)]
    pub args: serde_json::Value,
}

impl JobPayload {
    pub fn new(handler: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            handler: handler.into(),
            args,
        }
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, EngineError> {
        serde_json::from_value(value.clone())
            .map_err(|e| EngineError::InvalidPayload(e.to_string()))
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Ambient storage transaction exposed to handlers when
/// `perform_jobs_in_tx` is enabled.
///
/// Writes made through it commit together with the job's `succeeded`
/// transition, or not at all.
pub trait AmbientTx {
    /// Enqueue a follow-up job inside the ambient transaction.
    fn enqueue(&mut self, job: NewJob) -> Result<JobId, HandlerError>;

    /// Store-specific escape hatch (e.g. the live SQL transaction).
    fn as_any(&mut self) -> &mut dyn Any;
}

/// Invocation context passed to every handler.
pub struct PerformContext<'a> {
    pub job_id: JobId,
    pub queue: &'a str,
    /// Identity of the executing worker, as recorded in `locked_by`.
    pub performer: &'a PerformerId,
    /// Present only when executing inside a storage transaction.
    pub tx: Option<&'a mut dyn AmbientTx>,
}

impl std::fmt::Debug for PerformContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformContext")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("performer", &self.performer)
            .field("in_tx", &self.tx.is_some())
            .finish()
    }
}

/// A unit of executable job logic.
pub trait JobHandler: Send + Sync {
    fn perform(
        &self,
        args: &serde_json::Value,
        ctx: &mut PerformContext<'_>,
    ) -> Result<(), HandlerError>;
}

impl<F> JobHandler for F
where
    F: Fn(&serde_json::Value, &mut PerformContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    fn perform(
        &self,
        args: &serde_json::Value,
        ctx: &mut PerformContext<'_>,
    ) -> Result<(), HandlerError> {
        self(args, ctx)
    }
}

/// Name → handler map shared by all workers in a process.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name pattern. `"category.*"` matches any
    /// handler name with that prefix; `"*"` is the catch-all.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    /// Resolve a handler name: exact match, then category prefix, then
    /// catch-all.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn JobHandler>, EngineError> {
        if let Some(h) = self.handlers.get(name) {
            return Ok(h.clone());
        }

        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if name.starts_with(prefix) {
                    return Ok(handler.clone());
                }
            }
        }

        self.handlers
            .get("*")
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandler(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(
        _args: &serde_json::Value,
        _ctx: &mut PerformContext<'_>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    #[test]
    fn payload_round_trip() {
        let payload = JobPayload::new("mailer.send", serde_json::json!({"to": "ops"}));
        let value = payload.into_value();
        let parsed = JobPayload::from_value(&value).unwrap();
        assert_eq!(parsed.handler, "mailer.send");
        assert_eq!(parsed.args["to"], "ops");
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = JobPayload::from_value(&serde_json::json!(42)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPayload(_)));
    }

    #[test]
    fn resolve_prefers_exact_match() {
        let mut registry = HandlerRegistry::new();
        registry.register("mailer.send", noop);
        registry.register("mailer.*", noop);
        registry.register("*", noop);

        assert!(registry.resolve("mailer.send").is_ok());
        assert!(registry.resolve("mailer.bounce").is_ok());
        assert!(registry.resolve("anything").is_ok());
    }

    #[test]
    fn resolve_without_match_errors() {
        let mut registry = HandlerRegistry::new();
        registry.register("mailer.send", noop);

        let Err(err) = registry.resolve("reports.nightly") else {
            panic!("expected resolve to fail for an unregistered handler");
        };
        assert!(matches!(err, EngineError::UnknownHandler(name) if name == "reports.nightly"));
    }
}
