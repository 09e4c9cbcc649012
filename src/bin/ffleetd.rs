//! Master daemon: control API plus the housekeeping scheduler.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use ffleet::config::{MasterConfig, StoreKind};
use ffleet::lifecycle::RetryPolicy;
use ffleet::master::scheduler::{self, SchedulerConfig};
use ffleet::master::{Master, api};
use ffleet::store::{MemoryStore, SqliteStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = MasterConfig::parse();

    let store: Arc<dyn Store> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new(
            RetryPolicy::default(),
            config.sla_targets(),
        )),
        StoreKind::Sqlite => Arc::new(
            SqliteStore::open(&config.db_path)
                .with_context(|| format!("opening catalog at {}", config.db_path))?
                .with_policies(RetryPolicy::default(), config.sla_targets()),
        ),
    };
    let master = Arc::new(Master::new(store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler::run(
        master.clone(),
        SchedulerConfig {
            tick_interval: config.tick_interval(),
            node_dead_after: config.node_dead_after(),
            stale_after: config.stale_after(),
        },
        shutdown_rx,
    ));

    let app = api::router(master, config.api_key.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding control API to {}", config.bind))?;
    info!(addr = %config.bind, store = ?config.store, "ffleetd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control API server failed")?;

    // Request handlers are done; stop the background loop and wait for the
    // in-flight tick.
    shutdown_tx.send(true).ok();
    scheduler_task.await.ok();
    info!("ffleetd shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler installs");
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler installs");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler installs");
        info!("received ctrl-c, shutting down");
    }
}
