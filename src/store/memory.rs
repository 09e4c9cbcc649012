//! In-memory store. One global lock keeps every operation linearizable,
//! which is exactly the serialization contract the FSM needs; at the
//! scale of a single control plane the lock is never contended enough to
//! matter.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::dispatch;
use crate::domain::{Job, JobRequest, Node, NodeRegistration, NodeStatus};
use crate::lifecycle::{JobStatus, RetryPolicy, SlaTargets};
use crate::store::mutations::{self, RetryDisposition};
use crate::store::{FinalizeOutcome, Registered, Store, StoreError};

struct State {
    jobs: HashMap<String, Job>,
    nodes: HashMap<String, Node>,
    next_sequence: u64,
}

pub struct MemoryStore {
    state: Mutex<State>,
    retry_policy: RetryPolicy,
    sla_targets: SlaTargets,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), SlaTargets::default())
    }
}

impl MemoryStore {
    pub fn new(retry_policy: RetryPolicy, sla_targets: SlaTargets) -> Self {
        Self {
            state: Mutex::new(State {
                jobs: HashMap::new(),
                nodes: HashMap::new(),
                next_sequence: 1,
            }),
            retry_policy,
            sla_targets,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned store lock means an invariant already broke mid-write;
        // continuing with the data is still the best option we have.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Mutate a job and, when it names a worker, that worker, under one lock.
fn with_job_and_node<T>(
    state: &mut State,
    job_id: &str,
    f: impl FnOnce(&mut Job, Option<&mut Node>) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let State { jobs, nodes, .. } = state;
    let job = jobs.get_mut(job_id).ok_or(StoreError::JobNotFound)?;
    let node = if job.node_id.is_empty() {
        None
    } else {
        nodes.get_mut(&job.node_id)
    };
    f(job, node)
}

impl Store for MemoryStore {
    fn register_node(&self, reg: NodeRegistration) -> Result<Registered, StoreError> {
        let mut state = self.lock();
        let existing = state
            .nodes
            .values_mut()
            .find(|n| n.address == reg.address);
        match existing {
            Some(node) => {
                node.apply_reregistration(reg);
                Ok(Registered {
                    node: node.clone(),
                    created: false,
                })
            }
            None => {
                let node = Node::from_registration(reg);
                state.nodes.insert(node.node_id.clone(), node.clone());
                Ok(Registered {
                    node,
                    created: true,
                })
            }
        }
    }

    fn get_node(&self, node_id: &str) -> Result<Node, StoreError> {
        self.lock()
            .nodes
            .get(node_id)
            .cloned()
            .ok_or(StoreError::NodeNotFound)
    }

    fn get_node_by_address(&self, address: &str) -> Result<Option<Node>, StoreError> {
        Ok(self
            .lock()
            .nodes
            .values()
            .find(|n| n.address == address)
            .cloned())
    }

    fn get_all_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let mut nodes: Vec<Node> = self.lock().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(nodes)
    }

    fn delete_node(&self, node_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        let node = state.nodes.get(node_id).ok_or(StoreError::NodeNotFound)?;
        if node.status == NodeStatus::Busy || !node.current_job_id.is_empty() {
            return Err(StoreError::NodeBusy);
        }
        state.nodes.remove(node_id);
        Ok(())
    }

    fn update_node_heartbeat(&self, node_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        let State { jobs, nodes, .. } = &mut *state;
        let node = nodes.get_mut(node_id).ok_or(StoreError::NodeNotFound)?;
        node.last_heartbeat = chrono::Utc::now();
        if !node.current_job_id.is_empty() {
            if let Some(job) = jobs.get_mut(&node.current_job_id) {
                job.last_activity_at = Some(node.last_heartbeat);
            }
        }
        Ok(())
    }

    fn update_node_status(&self, node_id: &str, status: NodeStatus) -> Result<(), StoreError> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or(StoreError::NodeNotFound)?;
        node.status = status;
        Ok(())
    }

    fn create_job(&self, req: JobRequest) -> Result<Job, StoreError> {
        let mut state = self.lock();
        let seq = state.next_sequence;
        state.next_sequence += 1;
        let job = Job::from_request(req, seq);
        state.jobs.insert(job.job_id.clone(), job.clone());
        Ok(job)
    }

    fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound)
    }

    fn get_job_by_sequence(&self, sequence_number: u64) -> Result<Job, StoreError> {
        self.lock()
            .jobs
            .values()
            .find(|j| j.sequence_number == sequence_number)
            .cloned()
            .ok_or(StoreError::JobNotFound)
    }

    fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.sequence_number);
        Ok(jobs)
    }

    fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.lock();
        if !state.jobs.contains_key(&job.job_id) {
            return Err(StoreError::JobNotFound);
        }
        state.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    fn update_job_status(
        &self,
        job_id: &str,
        to: JobStatus,
        reason: &str,
    ) -> Result<Job, StoreError> {
        let mut state = self.lock();
        with_job_and_node(&mut state, job_id, |job, node| {
            mutations::transition(job, to, reason)?;
            if !to.is_active() {
                job.node_id.clear();
                if let Some(node) = node {
                    mutations::release_node(node);
                }
            }
            Ok(job.clone())
        })
    }

    fn update_job_activity(&self, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(job_id).ok_or(StoreError::JobNotFound)?;
        job.last_activity_at = Some(chrono::Utc::now());
        Ok(())
    }

    fn update_job_progress(&self, job_id: &str, progress: u8) -> Result<Job, StoreError> {
        let mut state = self.lock();
        with_job_and_node(&mut state, job_id, |job, _node| {
            if job.status == JobStatus::Assigned {
                mutations::transition(job, JobStatus::Running, "first progress report")?;
            }
            if job.status == JobStatus::Running {
                job.progress = progress.min(100);
                job.last_activity_at = Some(chrono::Utc::now());
            }
            // For any other state the report is stale; return the job
            // unchanged so the worker can observe e.g. a cancellation.
            Ok(job.clone())
        })
    }

    fn pause_job(&self, job_id: &str) -> Result<Job, StoreError> {
        let mut state = self.lock();
        with_job_and_node(&mut state, job_id, |job, node| {
            mutations::pause(job, node)?;
            Ok(job.clone())
        })
    }

    fn resume_job(&self, job_id: &str) -> Result<Job, StoreError> {
        let mut state = self.lock();
        with_job_and_node(&mut state, job_id, |job, _| {
            mutations::resume(job)?;
            Ok(job.clone())
        })
    }

    fn cancel_job(&self, job_id: &str) -> Result<Job, StoreError> {
        let mut state = self.lock();
        with_job_and_node(&mut state, job_id, |job, node| {
            mutations::cancel(job, node)?;
            Ok(job.clone())
        })
    }

    fn retry_job(&self, job_id: &str, reason: &str) -> Result<Job, StoreError> {
        let immediate = reason == "worker_died";
        let mut state = self.lock();
        with_job_and_node(&mut state, job_id, |job, node| {
            mutations::retry(job, node, reason, &self.retry_policy, immediate)?;
            Ok(job.clone())
        })
    }

    fn finalize_job(&self, job_id: &str, outcome: FinalizeOutcome) -> Result<Job, StoreError> {
        let mut state = self.lock();
        with_job_and_node(&mut state, job_id, |job, node| {
            if job.status.is_terminal() {
                // Idempotent: a re-delivered result for a settled job is
                // acknowledged, never re-applied.
                return Ok(job.clone());
            }
            mutations::finalize(job, node, outcome, &self.sla_targets)?;
            Ok(job.clone())
        })
    }

    fn try_queue_pending_job(&self, job_id: &str) -> Result<bool, StoreError> {
        let state = self.lock();
        let job = state.jobs.get(job_id).ok_or(StoreError::JobNotFound)?;
        Ok(job.status == JobStatus::Queued && job.node_id.is_empty())
    }

    fn get_next_job(&self, node_id: &str) -> Result<Job, StoreError> {
        let mut state = self.lock();
        let node = state.nodes.get(node_id).ok_or(StoreError::NodeNotFound)?;
        if node.status != NodeStatus::Available {
            return Err(StoreError::NoJobAvailable);
        }
        let candidate = dispatch::select_candidate(state.jobs.values(), node)
            .map(|j| j.job_id.clone())
            .ok_or(StoreError::NoJobAvailable)?;

        let State { jobs, nodes, .. } = &mut *state;
        let job = jobs.get_mut(&candidate).ok_or(StoreError::JobNotFound)?;
        let node = nodes.get_mut(node_id).ok_or(StoreError::NodeNotFound)?;
        mutations::claim(job, node)?;
        Ok(job.clone())
    }

    fn reassign_orphaned_jobs(&self, node_id: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.lock();
        {
            let node = state
                .nodes
                .get_mut(node_id)
                .ok_or(StoreError::NodeNotFound)?;
            node.status = NodeStatus::Offline;
            node.current_job_id.clear();
        }

        let orphaned: Vec<String> = state
            .jobs
            .values()
            .filter(|j| j.node_id == node_id && !j.status.is_terminal())
            .map(|j| j.job_id.clone())
            .collect();

        let mut requeued = Vec::new();
        for job_id in orphaned {
            let job = state.jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound)?;
            let disposition =
                mutations::retry(job, None, "worker_died", &self.retry_policy, true)?;
            if disposition == RetryDisposition::Requeued {
                requeued.push(job_id);
            }
        }
        Ok(requeued)
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    fn sla_targets(&self) -> &SlaTargets {
        &self.sla_targets
    }
}
