//! Persistent catalog of jobs, nodes and state transitions.
//!
//! Two implementations share one contract: [`MemoryStore`] for tests and
//! small deployments, [`SqliteStore`] for production. Every mutating call
//! either commits fully or has no observable effect, and all calls on the
//! same row serialize. [`Store::try_queue_pending_job`] and
//! [`Store::get_next_job`] are the only primitives the scheduler and the
//! dispatcher use to mutate sampled state, which keeps the two race-free.

mod memory;
mod mutations;
mod sqlite;

#[cfg(test)]
pub(crate) mod testsuite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::domain::{Job, JobRequest, Node, NodeRegistration, NodeStatus};
use crate::lifecycle::{InvalidTransition, JobStatus, RetryPolicy, SlaTargets};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found")]
    JobNotFound,
    #[error("node not found")]
    NodeNotFound,
    /// No queued job matches the requesting node right now.
    #[error("no job available")]
    NoJobAvailable,
    /// The node still owns a job and cannot be removed.
    #[error("node is busy")]
    NodeBusy,
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Outcome of a node registration.
#[derive(Debug, Clone)]
pub struct Registered {
    pub node: Node,
    /// False when an existing record with the same address was updated.
    pub created: bool,
}

/// Terminal outcome applied in one transaction by [`Store::finalize_job`].
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    /// `completed`, `failed`, `timed_out` or `canceled`.
    pub status: JobStatus,
    pub reason: String,
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub failure_reason: Option<crate::domain::FailureReason>,
    pub logs: Vec<String>,
    /// Worker-computed SLA verdict, if any; otherwise the store evaluates
    /// the platform targets itself for SLA-worthy jobs.
    pub sla_compliant: Option<bool>,
    pub sla_reason: Option<String>,
}

pub trait Store: Send + Sync {
    // Nodes.

    /// Insert a new node, or update the record with the same address:
    /// capabilities replace the stored ones, status resets to `available`,
    /// any stale claim is cleared and the heartbeat refreshes.
    fn register_node(&self, reg: NodeRegistration) -> Result<Registered, StoreError>;
    fn get_node(&self, node_id: &str) -> Result<Node, StoreError>;
    fn get_node_by_address(&self, address: &str) -> Result<Option<Node>, StoreError>;
    fn get_all_nodes(&self) -> Result<Vec<Node>, StoreError>;
    /// Fails with [`StoreError::NodeBusy`] while the node owns a job.
    fn delete_node(&self, node_id: &str) -> Result<(), StoreError>;
    /// Refresh `last_heartbeat`; also touches the current job's
    /// `last_activity_at`, binding worker liveness to job progress.
    fn update_node_heartbeat(&self, node_id: &str) -> Result<(), StoreError>;
    fn update_node_status(&self, node_id: &str, status: NodeStatus) -> Result<(), StoreError>;

    // Jobs.

    fn create_job(&self, req: JobRequest) -> Result<Job, StoreError>;
    fn get_job(&self, job_id: &str) -> Result<Job, StoreError>;
    fn get_job_by_sequence(&self, sequence_number: u64) -> Result<Job, StoreError>;
    fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError>;
    /// Full-row replacement; the caller must preserve the invariants.
    fn update_job(&self, job: &Job) -> Result<(), StoreError>;
    /// Validate and apply one FSM edge, appending the audit record and
    /// setting `completed_at` when the target is terminal.
    fn update_job_status(&self, job_id: &str, to: JobStatus, reason: &str)
    -> Result<Job, StoreError>;
    fn update_job_activity(&self, job_id: &str) -> Result<(), StoreError>;
    /// Record worker-observed progress. The first report moves an
    /// `assigned` job to `running` (the agent reports, the FSM decides).
    fn update_job_progress(&self, job_id: &str, progress: u8) -> Result<Job, StoreError>;

    // FSM drivers.

    fn pause_job(&self, job_id: &str) -> Result<Job, StoreError>;
    fn resume_job(&self, job_id: &str) -> Result<Job, StoreError>;
    fn cancel_job(&self, job_id: &str) -> Result<Job, StoreError>;
    /// Route the job through `retrying`: with attempts left it is scheduled
    /// for re-queueing (backoff per the retry policy, or immediately for
    /// infrastructure reasons); exhausted jobs fail.
    fn retry_job(&self, job_id: &str, reason: &str) -> Result<Job, StoreError>;
    /// Apply a terminal outcome in one transaction: transition (hopping
    /// `assigned -> running` when the engine start was never observed),
    /// outcome fields, SLA verdict, and release of the worker.
    fn finalize_job(&self, job_id: &str, outcome: FinalizeOutcome) -> Result<Job, StoreError>;

    // Scheduler primitives.

    /// Atomic assertion that the job is still `queued` with no worker.
    /// Returns false without side effects otherwise, so housekeeping never
    /// writes a state it only sampled.
    fn try_queue_pending_job(&self, job_id: &str) -> Result<bool, StoreError>;
    /// The claim: select the best queued job the node satisfies and, in one
    /// atomic step, move it to `assigned` and the node to `busy`.
    /// [`StoreError::NoJobAvailable`] when nothing fits.
    fn get_next_job(&self, node_id: &str) -> Result<Job, StoreError>;
    /// Mark the node offline and route every job it owned through
    /// `retrying` (re-queued when attempts remain, failed with
    /// `platform_error` otherwise). Returns the re-queued job ids.
    fn reassign_orphaned_jobs(&self, node_id: &str) -> Result<Vec<String>, StoreError>;

    /// The policies this store applies inside `retry_job` / `finalize_job`.
    fn retry_policy(&self) -> &RetryPolicy;
    fn sla_targets(&self) -> &SlaTargets;
}
