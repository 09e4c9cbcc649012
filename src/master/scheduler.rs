//! Housekeeping loop: per-job timeouts, the stale safety net, dead-node
//! detection with orphan reassignment, and retry backoff release. A
//! cooperative background task; it stops when the shutdown channel flips
//! and never blocks a request handler.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::NodeStatus;
use crate::lifecycle::JobStatus;
use crate::master::Master;
use crate::store::{FinalizeOutcome, StoreError};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Heartbeat silence after which a node is declared dead.
    pub node_dead_after: chrono::Duration,
    /// Hard ceiling for running jobs; normally `timeout_at` fires first.
    pub stale_after: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            node_dead_after: chrono::Duration::seconds(90),
            stale_after: chrono::Duration::minutes(30),
        }
    }
}

/// What one tick did; returned for tests and logged at debug level.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub timed_out: usize,
    pub stale_failed: usize,
    pub nodes_offlined: usize,
    pub jobs_reassigned: usize,
    pub retries_released: usize,
}

impl TickReport {
    fn is_empty(&self) -> bool {
        *self == TickReport::default()
    }
}

pub async fn run(master: Arc<Master>, config: SchedulerConfig, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        tick = ?config.tick_interval,
        dead_after = %config.node_dead_after,
        "scheduler loop started"
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tick(&master, &config) {
                    Ok(report) if !report.is_empty() => {
                        debug!(?report, "housekeeping tick");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "housekeeping tick failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("scheduler loop stopping");
                break;
            }
        }
    }
}

/// One housekeeping pass. Each step samples, then mutates only through
/// validated store primitives, so losing a race to a claim or a result
/// ingest is harmless: the edge is simply rejected and skipped.
pub fn tick(master: &Master, config: &SchedulerConfig) -> Result<TickReport, StoreError> {
    let mut report = TickReport::default();
    let now = Utc::now();
    let store = master.store();

    // 1a. Per-job timeouts.
    let jobs = store.get_all_jobs()?;
    let mut handled: HashSet<String> = HashSet::new();
    for job in &jobs {
        if !job.status.is_active() {
            continue;
        }
        let Some(timeout_at) = job.timeout_at else {
            continue;
        };
        if now < timeout_at {
            continue;
        }
        handled.insert(job.job_id.clone());

        let within_cap = job
            .started_at
            .map(|s| (now - s).num_seconds() <= store.sla_targets().max_processing_seconds)
            .unwrap_or(true);
        let mut observed = job.clone();
        observed.status = JobStatus::TimedOut;
        let retryable = within_cap && store.retry_policy().should_retry(&observed, "timeout");

        let outcome = if retryable {
            store
                .update_job_status(&job.job_id, JobStatus::TimedOut, "timeout exceeded")
                .and_then(|_| store.retry_job(&job.job_id, "timeout"))
        } else {
            store.finalize_job(
                &job.job_id,
                FinalizeOutcome {
                    status: JobStatus::TimedOut,
                    reason: "timeout exceeded".into(),
                    progress: None,
                    error: Some("job exceeded its computed timeout".into()),
                    failure_reason: None,
                    logs: Vec::new(),
                    sla_compliant: None,
                    sla_reason: None,
                },
            )
        };
        match outcome {
            Ok(_) => {
                report.timed_out += 1;
                info!(job_id = %job.job_id, retryable, "job timed out");
            }
            // Lost the race to a result ingest; the other writer won.
            Err(StoreError::InvalidTransition(_)) => {}
            Err(e) => return Err(e),
        }
    }

    // 1b. Stale safety net for running jobs the timeout never covered.
    for job in &jobs {
        if job.status != JobStatus::Running || handled.contains(&job.job_id) {
            continue;
        }
        let Some(started) = job.started_at else {
            continue;
        };
        if now - started <= config.stale_after {
            continue;
        }
        match store.finalize_job(
            &job.job_id,
            FinalizeOutcome {
                status: JobStatus::Failed,
                reason: "stale".into(),
                progress: None,
                error: Some("no completion within the stale ceiling".into()),
                failure_reason: None,
                logs: Vec::new(),
                sla_compliant: None,
                sla_reason: None,
            },
        ) {
            Ok(_) => {
                report.stale_failed += 1;
                warn!(job_id = %job.job_id, "stale job failed by safety net");
            }
            Err(StoreError::InvalidTransition(_)) => {}
            Err(e) => return Err(e),
        }
    }

    // 2. Dead nodes and their orphans.
    for node in store.get_all_nodes()? {
        if node.status == NodeStatus::Offline {
            continue;
        }
        if now - node.last_heartbeat <= config.node_dead_after {
            continue;
        }
        let requeued = store.reassign_orphaned_jobs(&node.node_id)?;
        report.nodes_offlined += 1;
        report.jobs_reassigned += requeued.len();
        warn!(
            node_id = %node.node_id,
            address = %node.address,
            requeued = requeued.len(),
            "node declared offline; orphans reassigned"
        );
    }

    // 3. Retry backoff release. Paused jobs carry no deadline and stay.
    for job in store.get_all_jobs()? {
        if job.status != JobStatus::Retrying {
            continue;
        }
        let Some(retry_at) = job.retry_at else {
            continue;
        };
        if now < retry_at {
            continue;
        }
        match store.update_job_status(&job.job_id, JobStatus::Queued, "backoff elapsed") {
            Ok(_) => {
                report.retries_released += 1;
                debug!(job_id = %job.job_id, "retry backoff elapsed, job requeued");
            }
            Err(StoreError::InvalidTransition(_)) => {}
            Err(e) => return Err(e),
        }
    }

    // Queue pressure visibility, re-validated through the atomic check.
    if let Some(wait) = master.oldest_pending_queue_wait()? {
        if wait > chrono::Duration::minutes(5) {
            warn!(
                oldest_wait_secs = wait.num_seconds(),
                "jobs are waiting unusually long; no capable worker polling?"
            );
        }
    }

    Ok(report)
}
