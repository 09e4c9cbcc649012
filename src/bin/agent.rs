//! Worker agent binary.

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use ffleet::config::AgentConfig;
use ffleet::worker;
use ffleet::wrapper::observe;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AgentConfig::parse();
    let observer = observe::init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(worker::run(config, observer.clone(), shutdown_rx));

    shutdown_signal().await;
    shutdown_tx.send(true).ok();
    agent.await??;

    let snapshot = observer.snapshot();
    info!(
        started = snapshot.started,
        completed = snapshot.completed,
        exit_zero = snapshot.exit_zero,
        sla_violations = snapshot.sla_violation,
        "agent shut down"
    );
    observe::shutdown();
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
