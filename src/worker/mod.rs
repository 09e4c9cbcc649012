//! Worker agent: detect hardware, register, heartbeat, poll for work,
//! execute under the wrapper, report results. The agent never drives job
//! state transitions itself; it reports observations and outcomes and the
//! master's FSM stays authoritative.

pub mod client;
pub mod engine_cmd;
pub mod hardware;
pub mod runner;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Semaphore, watch};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::worker::client::{ClientError, MasterClient};
use crate::worker::runner::RunContext;
use crate::wrapper::WrapperObserver;

/// Registration retry backoff: start quick, settle down.
const REGISTER_BACKOFF_START: Duration = Duration::from_secs(5);
const REGISTER_BACKOFF_MAX: Duration = Duration::from_secs(60);

pub async fn run(
    config: AgentConfig,
    observer: Arc<WrapperObserver>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let address = config
        .address
        .clone()
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "unknown-worker".to_string());
    let registration = hardware::detect_registration(address, config.name.clone());
    let engines = registration
        .labels
        .get(crate::domain::node::ENGINES_LABEL)
        .map(|v| v.split(',').map(str::to_string).collect::<Vec<_>>())
        .unwrap_or_default();
    let gpu_present = registration.has_gpu;

    let client = Arc::new(MasterClient::new(&config.master_url, config.api_key.clone())?);

    // Register until the master answers. A 200 instead of a 201 just
    // means the master still remembers us; same outcome either way.
    let node = {
        let mut backoff = REGISTER_BACKOFF_START;
        loop {
            match client.register(&registration).await {
                Ok(node) => break node,
                Err(e) => {
                    warn!(error = %e, "registration failed; retrying in {backoff:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                    backoff = (backoff * 2).min(REGISTER_BACKOFF_MAX);
                }
            }
        }
    };
    info!(
        node_id = %node.node_id,
        address = %node.address,
        node_type = %node.node_type.as_str(),
        "registered with master"
    );
    let node_id = Arc::new(RwLock::new(node.node_id));

    // Heartbeat task. A 404 means the master forgot us (restart with a
    // volatile store); re-register and carry on with the new identity.
    {
        let client = client.clone();
        let registration = registration.clone();
        let node_id = node_id.clone();
        let interval = config.heartbeat_interval();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let current = node_id.read().map(|id| id.clone()).unwrap_or_default();
                match client.heartbeat(&current).await {
                    Ok(()) => {}
                    Err(e) if e.downcast_ref::<ClientError>().is_some_and(|c| matches!(c, ClientError::NotFound)) => {
                        warn!("master does not know this node; re-registering");
                        if let Ok(node) = client.register(&registration).await {
                            if let Ok(mut id) = node_id.write() {
                                *id = node.node_id;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "heartbeat failed"),
                }
            }
        });
    }

    // Poll loop: ask for work only while execution slots are free.
    let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
    let cgroup_root = match config.cgroup_root.trim() {
        "" => None,
        root => Some(PathBuf::from(root)),
    };
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if slots.available_permits() == 0 {
            // Saturated; do not poll, the master would only tell us no.
            continue;
        }
        let current = node_id.read().map(|id| id.clone()).unwrap_or_default();
        let job = match client.next_job(&current).await {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "claim poll failed");
                continue;
            }
        };

        let permit = slots
            .clone()
            .acquire_owned()
            .await
            .context("execution semaphore closed")?;
        let ctx = RunContext {
            client: client.clone(),
            node_id: current,
            engines: engines.clone(),
            gpu_present,
            cgroup_root: cgroup_root.clone(),
            observer: observer.clone(),
        };
        tokio::spawn(async move {
            runner::execute_job(&ctx, job).await;
            drop(permit);
        });
    }

    // Engines keep running on shutdown: governance is non-owning, and the
    // master's sweeps will recover anything we leave behind.
    info!("agent stopping; in-flight workloads are left running");
    Ok(())
}
