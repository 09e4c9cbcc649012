//! Pure FSM mutations shared by both store implementations.
//!
//! Each helper mutates a loaded job (and the owning node when a worker has
//! to be released) and returns before anything is persisted, so a store can
//! run it inside whatever transaction scope it has. Every status change
//! goes through [`transition`], which is the single place the state graph,
//! the audit log, `completed_at` and `timeout_at` are enforced.

use chrono::Utc;

use crate::domain::{FailureReason, Job, Node, NodeStatus};
use crate::lifecycle::{
    InvalidTransition, JobStatus, RetryPolicy, SlaTargets, compute_timeout_at,
    evaluate_platform_sla, is_sla_worthy, validate_transition,
};
use crate::store::FinalizeOutcome;

/// Validate and apply one edge of the state graph.
pub(crate) fn transition(
    job: &mut Job,
    to: JobStatus,
    reason: &str,
) -> Result<(), InvalidTransition> {
    let from = job.status;
    validate_transition(from, to)?;
    job.record_transition(Some(from), to, reason);
    job.status = to;

    let now = Utc::now();
    if to.is_terminal() {
        job.completed_at = Some(now);
        job.retry_at = None;
        job.timeout_at = None;
    }
    match to {
        JobStatus::Queued => {
            job.retry_at = None;
        }
        JobStatus::Assigned => {
            job.timeout_at = Some(compute_timeout_at(to, job.engine, &job.parameters, now));
        }
        JobStatus::Running => {
            // Anchor the processing budget at the claim time so the stored
            // deadline is stable regardless of when the engine start was
            // observed.
            let anchor = job.started_at.unwrap_or(now);
            job.timeout_at = Some(compute_timeout_at(to, job.engine, &job.parameters, anchor));
        }
        _ => {}
    }
    job.last_activity_at = Some(now);
    Ok(())
}

/// The atomic claim: `queued -> assigned` plus worker reservation.
pub(crate) fn claim(job: &mut Job, node: &mut Node) -> Result<(), InvalidTransition> {
    transition(job, JobStatus::Assigned, &format!("claimed by {}", node.node_id))?;
    job.node_id = node.node_id.clone();
    job.started_at = Some(Utc::now());
    node.status = NodeStatus::Busy;
    node.current_job_id = job.job_id.clone();
    Ok(())
}

/// Give the worker back to the pool. Offline nodes stay offline.
pub(crate) fn release_node(node: &mut Node) {
    node.current_job_id.clear();
    if node.status == NodeStatus::Busy {
        node.status = NodeStatus::Available;
    }
}

fn detach(job: &mut Job, node: Option<&mut Node>) {
    job.node_id.clear();
    if let Some(node) = node {
        release_node(node);
    }
}

/// Park the job in `retrying` with no release deadline; only an explicit
/// resume lets it back into the queue.
pub(crate) fn pause(job: &mut Job, node: Option<&mut Node>) -> Result<(), InvalidTransition> {
    transition(job, JobStatus::Retrying, "paused")?;
    job.retry_at = None;
    job.started_at = None;
    job.timeout_at = None;
    detach(job, node);
    Ok(())
}

pub(crate) fn resume(job: &mut Job) -> Result<(), InvalidTransition> {
    transition(job, JobStatus::Queued, "resumed")?;
    job.retry_at = None;
    Ok(())
}

pub(crate) fn cancel(job: &mut Job, node: Option<&mut Node>) -> Result<(), InvalidTransition> {
    transition(job, JobStatus::Canceled, "canceled")?;
    detach(job, node);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDisposition {
    /// Re-queued immediately (infrastructure failure, no point backing off).
    Requeued,
    /// Parked in `retrying` until the backoff deadline.
    Scheduled,
    /// Attempts exhausted; the job failed.
    Exhausted,
}

/// Route a job through `retrying` after a failed attempt.
pub(crate) fn retry(
    job: &mut Job,
    node: Option<&mut Node>,
    reason: &str,
    policy: &RetryPolicy,
    immediate: bool,
) -> Result<RetryDisposition, InvalidTransition> {
    if job.retry_count >= job.max_retries {
        // Exhausted. `queued` has no direct edge to `failed`, so hop.
        if !job.status.can_transition_to(JobStatus::Failed) {
            transition(job, JobStatus::Retrying, reason)?;
        }
        transition(job, JobStatus::Failed, "retries exhausted")?;
        if job.failure_reason.is_none() {
            job.failure_reason = Some(FailureReason::PlatformError);
        }
        detach(job, node);
        return Ok(RetryDisposition::Exhausted);
    }

    transition(job, JobStatus::Retrying, reason)?;
    job.retry_count += 1;
    job.retry_reason = Some(reason.to_string());
    job.started_at = None;
    job.timeout_at = None;
    job.progress = 0;
    detach(job, node);

    if immediate {
        transition(job, JobStatus::Queued, "requeued")?;
        job.retry_at = None;
        Ok(RetryDisposition::Requeued)
    } else {
        let backoff = policy.backoff_for(job.retry_count);
        job.retry_at = Some(
            Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(300)),
        );
        Ok(RetryDisposition::Scheduled)
    }
}

/// Apply a terminal outcome reported for the job.
pub(crate) fn finalize(
    job: &mut Job,
    node: Option<&mut Node>,
    outcome: FinalizeOutcome,
    targets: &SlaTargets,
) -> Result<(), InvalidTransition> {
    // A result can arrive before any progress report; infer the missed
    // engine start so the audit trail stays well-formed.
    if job.status == JobStatus::Assigned && outcome.status == JobStatus::Completed {
        transition(job, JobStatus::Running, "engine start inferred from result")?;
    }

    if outcome.status == JobStatus::TimedOut {
        transition(job, JobStatus::TimedOut, &outcome.reason)?;
        transition(job, JobStatus::Failed, "retries exhausted")?;
    } else {
        transition(job, outcome.status, &outcome.reason)?;
    }

    if let Some(progress) = outcome.progress {
        job.progress = progress.min(100);
    } else if job.status == JobStatus::Completed {
        job.progress = 100;
    }
    if outcome.error.is_some() {
        job.error = outcome.error;
    }
    if outcome.failure_reason.is_some() {
        job.failure_reason = outcome.failure_reason;
    } else if outcome.status == JobStatus::TimedOut && job.failure_reason.is_none() {
        job.failure_reason = Some(FailureReason::Timeout);
    }
    for line in outcome.logs {
        job.push_log_line(line);
    }

    detach(job, node);

    if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
        if outcome.sla_compliant.is_some() {
            job.platform_sla_compliant = outcome.sla_compliant;
            job.platform_sla_reason = outcome.sla_reason;
        } else if is_sla_worthy(job) {
            let verdict = evaluate_platform_sla(job, targets);
            job.platform_sla_compliant = Some(verdict.compliant);
            job.platform_sla_reason = verdict.reason;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobRequest, NodeRegistration, NodeType};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn queued_job() -> Job {
        let mut req = JobRequest::for_scenario("720p30-h264");
        req.parameters.insert("duration".into(), json!(30));
        Job::from_request(req, 1)
    }

    fn node() -> Node {
        Node::from_registration(NodeRegistration {
            address: "w1".into(),
            node_type: NodeType::Desktop,
            name: None,
            cpu_threads: 8,
            cpu_model: "cpu".into(),
            has_gpu: false,
            gpu_type: None,
            gpu_capabilities: Vec::new(),
            ram_total_bytes: 0,
            labels: BTreeMap::new(),
        })
    }

    #[test]
    fn claim_reserves_worker_and_sets_assigned_ceiling() {
        let mut job = queued_job();
        let mut n = node();
        claim(&mut job, &mut n).expect("claim from queued must be legal");

        assert_eq!(job.status, JobStatus::Assigned);
        assert_eq!(job.node_id, n.node_id);
        assert!(job.started_at.is_some());
        assert_eq!(n.status, NodeStatus::Busy);
        assert_eq!(n.current_job_id, job.job_id);

        let deadline = job.timeout_at.expect("assigned jobs carry a timeout");
        let secs = (deadline - job.started_at.unwrap()).num_seconds();
        assert!((299..=301).contains(&secs), "assigned ceiling was {secs}s");
    }

    #[test]
    fn running_timeout_is_anchored_at_claim_time() {
        let mut job = queued_job();
        let mut n = node();
        claim(&mut job, &mut n).unwrap();
        transition(&mut job, JobStatus::Running, "progress").unwrap();

        let secs = (job.timeout_at.unwrap() - job.started_at.unwrap()).num_seconds();
        assert_eq!(secs, 60, "ffmpeg budget is duration x 2");
    }

    #[test]
    fn retry_clears_assignment_and_schedules_backoff() {
        let mut job = queued_job();
        let mut n = node();
        claim(&mut job, &mut n).unwrap();
        transition(&mut job, JobStatus::Running, "progress").unwrap();

        let d = retry(&mut job, Some(&mut n), "runtime_error", &RetryPolicy::default(), false)
            .unwrap();
        assert_eq!(d, RetryDisposition::Scheduled);
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);
        assert!(job.node_id.is_empty());
        assert!(job.retry_at.is_some());
        assert_eq!(n.status, NodeStatus::Available);
        assert!(n.current_job_id.is_empty());
    }

    #[test]
    fn immediate_retry_lands_back_in_queue() {
        let mut job = queued_job();
        let mut n = node();
        claim(&mut job, &mut n).unwrap();

        let d =
            retry(&mut job, Some(&mut n), "worker_died", &RetryPolicy::default(), true).unwrap();
        assert_eq!(d, RetryDisposition::Requeued);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.retry_at.is_none());
    }

    #[test]
    fn exhausted_retry_fails_with_platform_error() {
        let mut job = queued_job();
        job.retry_count = job.max_retries;
        let mut n = node();
        claim(&mut job, &mut n).unwrap();

        let d =
            retry(&mut job, Some(&mut n), "worker_died", &RetryPolicy::default(), true).unwrap();
        assert_eq!(d, RetryDisposition::Exhausted);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::PlatformError));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn pause_parks_without_release_deadline_and_resume_requeues() {
        let mut job = queued_job();
        pause(&mut job, None).unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert!(job.retry_at.is_none());

        resume(&mut job).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn finalize_infers_missed_engine_start() {
        let mut job = queued_job();
        let mut n = node();
        claim(&mut job, &mut n).unwrap();

        finalize(
            &mut job,
            Some(&mut n),
            FinalizeOutcome {
                status: JobStatus::Completed,
                reason: "result".into(),
                progress: None,
                error: None,
                failure_reason: None,
                logs: vec!["frame= 900".into()],
                sla_compliant: None,
                sla_reason: None,
            },
            &SlaTargets::default(),
        )
        .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
        assert!(job.node_id.is_empty());
        let states: Vec<JobStatus> = job.state_transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                JobStatus::Queued,
                JobStatus::Assigned,
                JobStatus::Running,
                JobStatus::Completed
            ]
        );
    }

    #[test]
    fn finalize_timeout_records_both_edges() {
        let mut job = queued_job();
        let mut n = node();
        claim(&mut job, &mut n).unwrap();
        transition(&mut job, JobStatus::Running, "progress").unwrap();

        finalize(
            &mut job,
            Some(&mut n),
            FinalizeOutcome {
                status: JobStatus::TimedOut,
                reason: "deadline exceeded".into(),
                progress: None,
                error: Some("killed at timeout".into()),
                failure_reason: None,
                logs: Vec::new(),
                sla_compliant: None,
                sla_reason: None,
            },
            &SlaTargets::default(),
        )
        .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::Timeout));
        let states: Vec<JobStatus> = job.state_transitions.iter().map(|t| t.to).collect();
        assert!(states.contains(&JobStatus::TimedOut));
    }

    #[test]
    fn cancel_from_terminal_is_rejected() {
        let mut job = queued_job();
        cancel(&mut job, None).unwrap();
        let err = cancel(&mut job, None).unwrap_err();
        assert_eq!(err.from, JobStatus::Canceled);
    }
}
