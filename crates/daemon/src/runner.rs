//! Foreground engine run.
//!
//! This is the mode the supervisor spawns: connect, ensure the schema,
//! register the maintenance handlers and run the engine until SIGTERM or
//! SIGINT, then drain.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use drayhorse_core::HandlerRegistry;
use drayhorse_infra::store::{JobStore, PostgresJobStore};
use drayhorse_infra::{Engine, register_maintenance_handlers};

use crate::settings::Settings;

pub fn run_foreground(settings: &Settings) -> anyhow::Result<()> {
    drayhorse_observability::init();

    let database_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let pool = runtime
        .block_on(
            PgPoolOptions::new()
                .max_connections(settings.config.pool_size as u32 + 2)
                .connect(database_url),
        )
        .context("connecting to database")?;

    let store = PostgresJobStore::new(pool, runtime.handle().clone());
    store.ensure_schema().context("ensuring schema")?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let mut registry = HandlerRegistry::new();
    register_maintenance_handlers(&mut registry, store.clone(), &settings.config);

    let handle = Engine::new(store, registry, settings.config.clone()).start();
    let trigger = handle.shutdown_trigger();

    runtime.spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        info!("termination signal received, draining");
        trigger.trigger();
    });

    handle
        .join(settings.drain_timeout)
        .context("engine terminated with error")?;
    Ok(())
}
