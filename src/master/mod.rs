//! The master facade: everything the control API and the scheduler loop
//! do goes through [`Master`], which wires the store to the lifecycle
//! policies and keeps the dispatch observation counters.

pub mod api;
pub mod scheduler;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{debug, info};

use crate::domain::{Job, JobRequest, JobResult, Node, NodeRegistration};
use crate::lifecycle::JobStatus;
use crate::store::{FinalizeOutcome, Registered, Store, StoreError};

/// Monotone `schedule_attempt` observations. A projection for operators
/// and tests; nothing reads these on a control path.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub success: AtomicU64,
    pub no_jobs: AtomicU64,
    pub error: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.success.load(Ordering::Relaxed),
            self.no_jobs.load(Ordering::Relaxed),
            self.error.load(Ordering::Relaxed),
        )
    }
}

/// Acknowledgement for a result ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultAck {
    /// The outcome was recorded (or had already been recorded).
    Success,
    /// The failure was absorbed and the job re-entered the retry path.
    Retrying,
}

pub struct Master {
    store: Arc<dyn Store>,
    stats: DispatchStats,
}

impl Master {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            stats: DispatchStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn dispatch_stats(&self) -> &DispatchStats {
        &self.stats
    }

    // Jobs.

    pub fn submit_job(&self, req: JobRequest) -> Result<Job, StoreError> {
        let job = self.store.create_job(req)?;
        info!(
            job_id = %job.job_id,
            seq = job.sequence_number,
            scenario = %job.scenario,
            queue = %job.queue.as_str(),
            priority = %job.priority.as_str(),
            "job submitted"
        );
        Ok(job)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.store.get_all_jobs()
    }

    /// Jobs are addressable by opaque id or by decimal sequence number.
    pub fn resolve_job(&self, selector: &str) -> Result<Job, StoreError> {
        match self.store.get_job(selector) {
            Err(StoreError::JobNotFound) => match selector.parse::<u64>() {
                Ok(seq) => self.store.get_job_by_sequence(seq),
                Err(_) => Err(StoreError::JobNotFound),
            },
            other => other,
        }
    }

    pub fn pause_job(&self, selector: &str) -> Result<Job, StoreError> {
        let job = self.resolve_job(selector)?;
        self.store.pause_job(&job.job_id)
    }

    pub fn resume_job(&self, selector: &str) -> Result<Job, StoreError> {
        let job = self.resolve_job(selector)?;
        self.store.resume_job(&job.job_id)
    }

    pub fn cancel_job(&self, selector: &str) -> Result<Job, StoreError> {
        let job = self.resolve_job(selector)?;
        let job = self.store.cancel_job(&job.job_id)?;
        info!(job_id = %job.job_id, "job canceled");
        Ok(job)
    }

    pub fn retry_job(&self, selector: &str) -> Result<Job, StoreError> {
        let job = self.resolve_job(selector)?;
        self.store.retry_job(&job.job_id, "manual retry")
    }

    pub fn report_progress(&self, job_id: &str, progress: u8) -> Result<Job, StoreError> {
        self.store.update_job_progress(job_id, progress)
    }

    // Dispatch.

    /// The claim endpoint. `Ok(None)` means "nothing for you right now";
    /// the worker polls again.
    pub fn claim_next_job(&self, node_id: &str) -> Result<Option<Job>, StoreError> {
        match self.store.get_next_job(node_id) {
            Ok(job) => {
                self.stats.success.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %job.job_id, node_id = %node_id, "job claimed");
                Ok(Some(job))
            }
            Err(StoreError::NoJobAvailable) => {
                self.stats.no_jobs.fetch_add(1, Ordering::Relaxed);
                debug!(node_id = %node_id, "claim attempt found no job");
                Ok(None)
            }
            Err(e) => {
                self.stats.error.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    // Results.

    /// Record a worker-reported outcome. Failed results with retries
    /// remaining re-enter the retry path; everything else finalizes.
    pub fn ingest_result(&self, result: JobResult) -> Result<ResultAck, StoreError> {
        let job = self.store.get_job(&result.job_id)?;
        if job.status.is_terminal() {
            // Duplicate delivery after a lost ACK; nothing to re-apply.
            return Ok(ResultAck::Success);
        }

        let retryable = match result.status {
            JobStatus::Failed | JobStatus::TimedOut => {
                let reason_retryable = result
                    .failure_reason
                    .map(|r| r.is_retryable())
                    .unwrap_or(true);
                reason_retryable && self.retry_allowed(&job, &result)
            }
            _ => false,
        };

        if retryable {
            let reason = result
                .failure_reason
                .map(|r| r.as_str())
                .unwrap_or("runtime_error");
            return match self.store.retry_job(&result.job_id, reason) {
                // An exhausted job comes back terminal even from here.
                Ok(job) if job.status.is_terminal() => Ok(ResultAck::Success),
                Ok(_) => Ok(ResultAck::Retrying),
                // The scheduler already moved the job (e.g. timed it out
                // and re-queued it); the report is stale, not wrong.
                Err(StoreError::InvalidTransition(_)) => Ok(ResultAck::Success),
                Err(e) => Err(e),
            };
        }

        let outcome = FinalizeOutcome {
            status: result.status,
            reason: format!("result from {}", result.node_id),
            progress: result.progress,
            error: result.error,
            failure_reason: result.failure_reason,
            logs: result.logs,
            sla_compliant: result.platform_sla_compliant,
            sla_reason: result.platform_sla_reason,
        };
        match self.store.finalize_job(&result.job_id, outcome) {
            Ok(_) => Ok(ResultAck::Success),
            Err(StoreError::InvalidTransition(e)) => {
                debug!(job_id = %result.job_id, error = %e, "stale result acknowledged");
                Ok(ResultAck::Success)
            }
            Err(e) => Err(e),
        }
    }

    /// Retry gate for a reported failure: the policy decides on the
    /// reported outcome, and timeouts that already blew through the
    /// processing cap are final.
    fn retry_allowed(&self, job: &Job, result: &JobResult) -> bool {
        let mut observed = job.clone();
        observed.status = result.status;
        observed.error = result.error.clone().or(observed.error);

        if result.status == JobStatus::TimedOut {
            let processing = job
                .started_at
                .map(|s| (result.completed_at - s).num_seconds())
                .unwrap_or(0);
            if processing > self.store.sla_targets().max_processing_seconds {
                return false;
            }
        }

        let reason = result
            .failure_reason
            .map(|r| r.as_str())
            .unwrap_or("runtime_error");
        self.store.retry_policy().should_retry(&observed, reason)
    }

    // Nodes.

    pub fn register_node(&self, reg: NodeRegistration) -> Result<Registered, StoreError> {
        let registered = self.store.register_node(reg)?;
        info!(
            node_id = %registered.node.node_id,
            address = %registered.node.address,
            created = registered.created,
            "node registered"
        );
        Ok(registered)
    }

    pub fn node_heartbeat(&self, node_id: &str) -> Result<(), StoreError> {
        self.store.update_node_heartbeat(node_id)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.store.get_all_nodes()
    }

    pub fn get_node(&self, node_id: &str) -> Result<Node, StoreError> {
        self.store.get_node(node_id)
    }

    pub fn remove_node(&self, node_id: &str) -> Result<(), StoreError> {
        self.store.delete_node(node_id)
    }

    /// Queue wait of the oldest still-pending job, if any. Re-validates
    /// the sampled job through the atomic check so a concurrent claim
    /// cannot make us report a job that is no longer pending.
    pub fn oldest_pending_queue_wait(&self) -> Result<Option<chrono::Duration>, StoreError> {
        let now = Utc::now();
        let mut queued: Vec<Job> = self
            .list_jobs()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        queued.sort_by_key(|j| j.created_at);
        for job in queued {
            if self.store.try_queue_pending_job(&job.job_id)? {
                return Ok(Some(now - job.created_at));
            }
        }
        Ok(None)
    }
}
