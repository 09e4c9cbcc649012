//! End-to-end control-plane scenarios driven through the master facade
//! with the in-memory catalog: the full claim/execute/report cycle as the
//! worker and scheduler would drive it, without the HTTP layer in between.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ffleet::domain::{
    FailureReason, JobRequest, NodeRegistration, NodeStatus, NodeType, Priority, QueueClass,
};
use ffleet::lifecycle::JobStatus;
use ffleet::master::scheduler::{self, SchedulerConfig};
use ffleet::master::{Master, ResultAck};
use ffleet::store::MemoryStore;
use ffleet::JobResult;

fn master() -> Arc<Master> {
    Arc::new(Master::new(Arc::new(MemoryStore::default())))
}

fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: Duration::from_millis(20),
        node_dead_after: chrono::Duration::milliseconds(100),
        stale_after: chrono::Duration::minutes(30),
    }
}

fn cpu_node(address: &str) -> NodeRegistration {
    NodeRegistration {
        address: address.into(),
        node_type: NodeType::Desktop,
        name: None,
        cpu_threads: 8,
        cpu_model: "test-cpu".into(),
        has_gpu: false,
        gpu_type: None,
        gpu_capabilities: Vec::new(),
        ram_total_bytes: 16 << 30,
        labels: BTreeMap::new(),
    }
}

#[test]
fn happy_path_traverses_the_full_lifecycle() {
    let m = master();
    let mut req = JobRequest::for_scenario("720p30-h264");
    req.engine = ffleet::domain::EngineKind::Ffmpeg;
    req.parameters.insert("duration".into(), json!(30));
    req.parameters.insert("bitrate".into(), json!("2M"));
    let submitted = m.submit_job(req).unwrap();
    assert_eq!(submitted.status, JobStatus::Queued);

    let node = m.register_node(cpu_node("worker-1")).unwrap().node;
    let claimed = m.claim_next_job(&node.node_id).unwrap().expect("job claimed");
    assert_eq!(claimed.job_id, submitted.job_id);

    // First progress report confirms the engine started.
    let running = m.report_progress(&claimed.job_id, 25).unwrap();
    assert_eq!(running.status, JobStatus::Running);

    // ffmpeg budget: duration x 2, anchored at the claim.
    let started_at = running.started_at.expect("claim set started_at");
    let timeout_at = running.timeout_at.expect("running jobs carry a timeout");
    assert_eq!((timeout_at - started_at).num_seconds(), 60);

    let ack = m
        .ingest_result(JobResult::success(&claimed.job_id, &node.node_id))
        .unwrap();
    assert_eq!(ack, ResultAck::Success);

    let done = m.resolve_job(&claimed.job_id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 0);
    assert_eq!(done.progress, 100);
    assert!(done.completed_at.is_some());
    assert_eq!(done.platform_sla_compliant, Some(true));

    let states: Vec<JobStatus> = done.state_transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            JobStatus::Queued,
            JobStatus::Assigned,
            JobStatus::Running,
            JobStatus::Completed
        ]
    );

    let node = m.get_node(&node.node_id).unwrap();
    assert_eq!(node.status, NodeStatus::Available);
    assert!(node.current_job_id.is_empty());
}

#[test]
fn priority_ordering_dispatches_live_then_default_then_batch() {
    let m = master();

    let mut c = JobRequest::for_scenario("c");
    c.queue = QueueClass::Batch;
    c.priority = Priority::Low;
    let c = m.submit_job(c).unwrap();

    let mut b = JobRequest::for_scenario("b");
    b.queue = QueueClass::Default;
    b.priority = Priority::Medium;
    let b = m.submit_job(b).unwrap();

    let mut a = JobRequest::for_scenario("a");
    a.queue = QueueClass::Live;
    a.priority = Priority::High;
    let a = m.submit_job(a).unwrap();

    let node = m.register_node(cpu_node("worker-1")).unwrap().node;
    let mut claim_times = Vec::new();
    let mut claim_order = Vec::new();
    for _ in 0..3 {
        let job = m.claim_next_job(&node.node_id).unwrap().expect("claim");
        claim_order.push(job.job_id.clone());
        claim_times.push(
            job.state_transitions
                .iter()
                .find(|t| t.to == JobStatus::Assigned)
                .expect("claim writes an assigned transition")
                .at,
        );
        m.ingest_result(JobResult::success(&job.job_id, &node.node_id))
            .unwrap();
    }

    assert_eq!(claim_order, vec![a.job_id, b.job_id, c.job_id]);
    assert!(claim_times[0] < claim_times[1] && claim_times[1] < claim_times[2]);
}

#[test]
fn capability_filtering_leaves_hevc_to_the_gpu_node() {
    let m = master();
    let mut req = JobRequest::for_scenario("4K60-h264");
    req.engine = ffleet::domain::EngineKind::Ffmpeg;
    req.parameters.insert("codec".into(), json!("h265"));
    let job = m.submit_job(req).unwrap();

    let n1 = m.register_node(cpu_node("plain-box")).unwrap().node;
    let mut gpu_reg = cpu_node("gpu-box");
    gpu_reg.has_gpu = true;
    gpu_reg.gpu_type = Some("NVIDIA RTX A4000".into());
    gpu_reg.gpu_capabilities = vec!["nvenc_h264".into(), "nvenc_hevc".into()];
    let n2 = m.register_node(gpu_reg).unwrap().node;

    assert!(
        m.claim_next_job(&n1.node_id).unwrap().is_none(),
        "CPU-only node polls empty"
    );
    let claimed = m.claim_next_job(&n2.node_id).unwrap().expect("GPU node claims");
    assert_eq!(claimed.job_id, job.job_id);
}

#[test]
fn worker_death_requeues_the_job_for_a_fresh_worker() {
    let m = master();
    let mut req = JobRequest::for_scenario("720p30-h264");
    req.parameters.insert("duration".into(), json!(30));
    let job = m.submit_job(req).unwrap();

    let dead = m.register_node(cpu_node("doomed")).unwrap().node;
    m.claim_next_job(&dead.node_id).unwrap().expect("claim");
    m.report_progress(&job.job_id, 40).unwrap();
    assert_eq!(m.resolve_job(&job.job_id).unwrap().status, JobStatus::Running);

    // No heartbeats arrive; the sweep declares the node dead.
    std::thread::sleep(Duration::from_millis(150));
    let report = scheduler::tick(&m, &fast_scheduler()).unwrap();
    assert_eq!(report.nodes_offlined, 1);
    assert_eq!(report.jobs_reassigned, 1);

    let requeued = m.resolve_job(&job.job_id).unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.node_id.is_empty());
    let states: Vec<JobStatus> = requeued.state_transitions.iter().map(|t| t.to).collect();
    assert!(
        states.ends_with(&[JobStatus::Retrying, JobStatus::Queued]),
        "death routes through retrying, got {states:?}"
    );

    let fresh = m.register_node(cpu_node("fresh")).unwrap().node;
    let reclaimed = m.claim_next_job(&fresh.node_id).unwrap().expect("reclaim");
    assert_eq!(reclaimed.job_id, job.job_id);
    assert_eq!(reclaimed.node_id, fresh.node_id);
}

#[test]
fn cancellation_during_run_reaches_the_worker_on_next_report() {
    let m = master();
    let mut req = JobRequest::for_scenario("720p30-h264");
    req.parameters.insert("duration".into(), json!(30));
    let job = m.submit_job(req).unwrap();

    let node = m.register_node(cpu_node("worker-1")).unwrap().node;
    m.claim_next_job(&node.node_id).unwrap().expect("claim");
    m.report_progress(&job.job_id, 10).unwrap();

    m.cancel_job(&job.job_id).unwrap();

    // The worker's next progress report observes the cancellation and
    // mutates nothing.
    let observed = m.report_progress(&job.job_id, 55).unwrap();
    assert_eq!(observed.status, JobStatus::Canceled);
    assert_ne!(observed.progress, 55);

    let job = m.resolve_job(&job.job_id).unwrap();
    assert!(job.status.is_terminal());
    assert!(job.completed_at.is_some());
    assert!(job.node_id.is_empty());

    let node = m.get_node(&node.node_id).unwrap();
    assert!(node.current_job_id.is_empty());

    // The worker's canceled result is acknowledged idempotently.
    let mut result = JobResult::success(&job.job_id, &node.node_id);
    result.status = JobStatus::Canceled;
    assert_eq!(m.ingest_result(result).unwrap(), ResultAck::Success);
}

#[test]
fn reregistration_after_crash_recovers_the_orphan() {
    let m = master();
    let mut req = JobRequest::for_scenario("720p30-h264");
    req.parameters.insert("duration".into(), json!(30));
    let job = m.submit_job(req).unwrap();

    let node = m.register_node(cpu_node("worker-1")).unwrap().node;
    m.claim_next_job(&node.node_id).unwrap().expect("claim");
    m.report_progress(&job.job_id, 10).unwrap();

    // The worker crashes and comes back under the same address.
    let again = m.register_node(cpu_node("worker-1")).unwrap();
    assert!(!again.created, "same address re-registers, not duplicates");
    assert_eq!(again.node.node_id, node.node_id);
    assert_eq!(again.node.status, NodeStatus::Available);
    assert!(again.node.current_job_id.is_empty());

    // The job now references a node that no longer claims it; the sweep
    // cannot rely on heartbeat silence (the node just heartbeat via
    // registration), so the orphan is recovered through reassignment when
    // the claim binding is found broken. Drive it explicitly the way the
    // scheduler does once the heartbeat goes quiet.
    std::thread::sleep(Duration::from_millis(150));
    scheduler::tick(&m, &fast_scheduler()).unwrap();

    let recovered = m.resolve_job(&job.job_id).unwrap();
    assert_eq!(recovered.status, JobStatus::Queued);
    assert!(recovered.node_id.is_empty());

    let second = m.register_node(cpu_node("worker-2")).unwrap().node;
    let reclaimed = m.claim_next_job(&second.node_id).unwrap().expect("reclaim");
    assert_eq!(reclaimed.job_id, job.job_id);
}

#[test]
fn retry_transitions_stay_bounded_by_max_retries() {
    let m = master();
    let job = m.submit_job(JobRequest::for_scenario("bounded")).unwrap();

    for _ in 0..5 {
        let node = m.register_node(cpu_node("churner")).unwrap().node;
        if m.claim_next_job(&node.node_id).unwrap().is_none() {
            break;
        }
        m.store().reassign_orphaned_jobs(&node.node_id).unwrap();
    }

    let finished = m.resolve_job(&job.job_id).unwrap();
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.failure_reason, Some(FailureReason::PlatformError));
    assert!(finished.retry_count <= finished.max_retries);
    // Transition count is O(max_retries): each attempt contributes a
    // bounded number of edges.
    assert!(
        finished.state_transitions.len() <= 3 + 3 * (finished.max_retries as usize + 1),
        "unexpected transition count: {}",
        finished.state_transitions.len()
    );
}
