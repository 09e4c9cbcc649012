//! Contract tests every store implementation must pass. The same suite
//! runs against the memory and the sqlite variants so the two can never
//! drift apart on FSM semantics.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use crate::domain::{
    EngineKind, FailureReason, JobRequest, NodeRegistration, NodeStatus, NodeType, Priority,
    QueueClass,
};
use crate::lifecycle::JobStatus;
use crate::store::{FinalizeOutcome, Store, StoreError};

fn registration(address: &str) -> NodeRegistration {
    NodeRegistration {
        address: address.into(),
        node_type: NodeType::Desktop,
        name: None,
        cpu_threads: 8,
        cpu_model: "contract-test-cpu".into(),
        has_gpu: false,
        gpu_type: None,
        gpu_capabilities: Vec::new(),
        ram_total_bytes: 16 << 30,
        labels: BTreeMap::new(),
    }
}

fn request(scenario: &str) -> JobRequest {
    let mut req = JobRequest::for_scenario(scenario);
    req.parameters.insert("duration".into(), json!(30));
    req.parameters.insert("bitrate".into(), json!("2M"));
    req
}

fn plain_finalize(status: JobStatus) -> FinalizeOutcome {
    FinalizeOutcome {
        status,
        reason: "test result".into(),
        progress: None,
        error: None,
        failure_reason: None,
        logs: Vec::new(),
        sla_compliant: None,
        sla_reason: None,
    }
}

pub(crate) fn register_is_idempotent_by_address(store: Arc<dyn Store>) {
    let first = store.register_node(registration("w1")).unwrap();
    assert!(first.created);

    let mut again = registration("w1");
    again.cpu_threads = 32;
    again.gpu_capabilities = vec!["nvenc_hevc".into()];
    let second = store.register_node(again).unwrap();
    assert!(!second.created, "re-registration must update, not insert");
    assert_eq!(second.node.node_id, first.node.node_id);
    assert_eq!(second.node.capabilities.cpu_threads, 32);

    let all = store.get_all_nodes().unwrap();
    assert_eq!(all.len(), 1, "exactly one row per address");
    assert_eq!(all[0].capabilities.cpu_threads, 32);
}

pub(crate) fn reregistration_clears_stale_claim(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    store.create_job(request("s")).unwrap();
    let job = store.get_next_job(&node.node_id).unwrap();
    assert_eq!(store.get_node(&node.node_id).unwrap().current_job_id, job.job_id);

    let node = store.register_node(registration("w1")).unwrap().node;
    assert_eq!(node.status, NodeStatus::Available);
    assert!(node.current_job_id.is_empty());
}

pub(crate) fn claim_moves_exactly_one_job_and_busies_the_node(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    store.create_job(request("a")).unwrap();
    store.create_job(request("b")).unwrap();

    let claimed = store.get_next_job(&node.node_id).unwrap();
    assert_eq!(claimed.status, JobStatus::Assigned);
    assert_eq!(claimed.node_id, node.node_id);
    assert!(claimed.started_at.is_some());
    assert!(claimed.timeout_at.is_some());

    let node = store.get_node(&node.node_id).unwrap();
    assert_eq!(node.status, NodeStatus::Busy);
    assert_eq!(node.current_job_id, claimed.job_id);

    let assigned: Vec<_> = store
        .get_all_jobs()
        .unwrap()
        .into_iter()
        .filter(|j| j.status == JobStatus::Assigned)
        .collect();
    assert_eq!(assigned.len(), 1, "exactly one job may move per claim");

    // A busy node gets nothing further.
    assert!(matches!(
        store.get_next_job(&node.node_id),
        Err(StoreError::NoJobAvailable)
    ));
}

pub(crate) fn dispatch_order_is_queue_priority_fifo(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;

    let mut batch = request("c-batch-low");
    batch.queue = QueueClass::Batch;
    batch.priority = Priority::Low;
    let c = store.create_job(batch).unwrap();

    let mut live = request("a-live-high");
    live.queue = QueueClass::Live;
    live.priority = Priority::High;
    let a = store.create_job(live).unwrap();

    let b = store.create_job(request("b-default-medium")).unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        let job = store.get_next_job(&node.node_id).unwrap();
        order.push(job.job_id.clone());
        store
            .finalize_job(&job.job_id, plain_finalize(JobStatus::Completed))
            .unwrap();
    }
    assert_eq!(order, vec![a.job_id, b.job_id, c.job_id]);
}

pub(crate) fn capability_filter_skips_unqualified_nodes(store: Arc<dyn Store>) {
    let plain = store.register_node(registration("cpu-only")).unwrap().node;
    let mut gpu_reg = registration("gpu-box");
    gpu_reg.has_gpu = true;
    gpu_reg.gpu_capabilities = vec!["nvenc_h264".into(), "nvenc_hevc".into()];
    let gpu = store.register_node(gpu_reg).unwrap().node;

    let mut req = request("4K60-h264");
    req.engine = EngineKind::Ffmpeg;
    req.parameters.insert("codec".into(), json!("h265"));
    let job = store.create_job(req).unwrap();

    assert!(
        matches!(store.get_next_job(&plain.node_id), Err(StoreError::NoJobAvailable)),
        "node without nvenc_hevc must not claim the job"
    );
    let claimed = store.get_next_job(&gpu.node_id).unwrap();
    assert_eq!(claimed.job_id, job.job_id);
}

pub(crate) fn concurrent_claims_assign_each_job_once(store: Arc<dyn Store>) {
    let workers = 4;
    let jobs = 12;
    let mut node_ids = Vec::new();
    for i in 0..workers {
        node_ids.push(store.register_node(registration(&format!("w{i}"))).unwrap().node.node_id);
    }
    for i in 0..jobs {
        store.create_job(request(&format!("job-{i}"))).unwrap();
    }

    // Drain the queue from concurrently polling workers, finishing each
    // claim so the node frees up for the next poll.
    let handles: Vec<_> = node_ids
        .into_iter()
        .map(|node_id| {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut claimed = Vec::new();
                loop {
                    match store.get_next_job(&node_id) {
                        Ok(job) => {
                            claimed.push(job.job_id.clone());
                            store
                                .finalize_job(&job.job_id, plain_finalize(JobStatus::Completed))
                                .unwrap();
                        }
                        Err(StoreError::NoJobAvailable) => break,
                        Err(e) => panic!("unexpected claim error: {e}"),
                    }
                }
                claimed
            })
        })
        .collect();

    let mut all: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("claim thread panicked"))
        .collect();
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), total, "a job was claimed by more than one worker");
    assert_eq!(total, jobs, "every job must be claimed exactly once");
}

pub(crate) fn cancel_running_job_frees_the_worker(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    store.create_job(request("s")).unwrap();
    let job = store.get_next_job(&node.node_id).unwrap();
    store.update_job_progress(&job.job_id, 10).unwrap();

    let canceled = store.cancel_job(&job.job_id).unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert!(canceled.completed_at.is_some());
    assert!(canceled.node_id.is_empty());

    let node = store.get_node(&node.node_id).unwrap();
    assert_eq!(node.status, NodeStatus::Available);
    assert!(node.current_job_id.is_empty());
}

pub(crate) fn pause_parks_and_resume_requeues(store: Arc<dyn Store>) {
    let job = store.create_job(request("s")).unwrap();

    let paused = store.pause_job(&job.job_id).unwrap();
    assert_eq!(paused.status, JobStatus::Retrying);
    assert!(paused.retry_at.is_none(), "paused jobs carry no release deadline");

    let resumed = store.resume_job(&job.job_id).unwrap();
    assert_eq!(resumed.status, JobStatus::Queued);
}

pub(crate) fn reassign_orphans_requeues_with_retry_accounting(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    store.create_job(request("s")).unwrap();
    let job = store.get_next_job(&node.node_id).unwrap();
    store.update_job_progress(&job.job_id, 42).unwrap();

    let requeued = store.reassign_orphaned_jobs(&node.node_id).unwrap();
    assert_eq!(requeued, vec![job.job_id.clone()]);

    let job = store.get_job(&job.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);
    assert!(job.node_id.is_empty());
    assert!(job.started_at.is_none());

    let node = store.get_node(&node.node_id).unwrap();
    assert_eq!(node.status, NodeStatus::Offline);
    assert!(node.current_job_id.is_empty());
}

pub(crate) fn reassign_exhausts_into_platform_failure(store: Arc<dyn Store>) {
    store.register_node(registration("w1")).unwrap();
    let job = store.create_job(request("s")).unwrap();

    // Ride the claim/death cycle until retries run out.
    for round in 0..4 {
        let node = store.register_node(registration("w1")).unwrap().node;
        let claimed = store.get_next_job(&node.node_id).unwrap();
        assert_eq!(claimed.job_id, job.job_id);
        let requeued = store.reassign_orphaned_jobs(&node.node_id).unwrap();
        if round < 3 {
            assert_eq!(requeued.len(), 1, "round {round} should requeue");
        } else {
            assert!(requeued.is_empty(), "exhausted job must not requeue");
        }
    }

    let job = store.get_job(&job.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason, Some(FailureReason::PlatformError));
    assert!(job.completed_at.is_some());
    assert!(job.retry_count <= job.max_retries);
}

pub(crate) fn heartbeat_touches_current_job_activity(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    store.create_job(request("s")).unwrap();
    let job = store.get_next_job(&node.node_id).unwrap();
    let before = store.get_job(&job.job_id).unwrap().last_activity_at;

    std::thread::sleep(std::time::Duration::from_millis(5));
    store.update_node_heartbeat(&node.node_id).unwrap();

    let after = store.get_job(&job.job_id).unwrap().last_activity_at;
    assert!(after > before, "heartbeat must advance the job's activity");
}

pub(crate) fn busy_nodes_cannot_be_deleted(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    store.create_job(request("s")).unwrap();
    store.get_next_job(&node.node_id).unwrap();

    assert!(matches!(
        store.delete_node(&node.node_id),
        Err(StoreError::NodeBusy)
    ));
}

pub(crate) fn sequence_numbers_are_monotone_and_resolvable(store: Arc<dyn Store>) {
    let first = store.create_job(request("a")).unwrap();
    let second = store.create_job(request("b")).unwrap();
    assert!(second.sequence_number > first.sequence_number);

    let by_seq = store.get_job_by_sequence(first.sequence_number).unwrap();
    assert_eq!(by_seq.job_id, first.job_id);
    assert!(matches!(
        store.get_job_by_sequence(9999),
        Err(StoreError::JobNotFound)
    ));
}

pub(crate) fn finalize_is_idempotent_for_terminal_jobs(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    store.create_job(request("s")).unwrap();
    let job = store.get_next_job(&node.node_id).unwrap();

    let done = store
        .finalize_job(&job.job_id, plain_finalize(JobStatus::Completed))
        .unwrap();
    let transitions = done.state_transitions.len();

    // A redelivered result must be acknowledged without another edge.
    let again = store
        .finalize_job(&job.job_id, plain_finalize(JobStatus::Failed))
        .unwrap();
    assert_eq!(again.status, JobStatus::Completed);
    assert_eq!(again.state_transitions.len(), transitions);
}

pub(crate) fn invalid_edges_are_rejected(store: Arc<dyn Store>) {
    let job = store.create_job(request("s")).unwrap();
    let err = store
        .update_job_status(&job.job_id, JobStatus::Completed, "nope")
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition(_)));

    // And the failed call left nothing behind.
    let unchanged = store.get_job(&job.job_id).unwrap();
    assert_eq!(unchanged.status, JobStatus::Queued);
    assert_eq!(unchanged.state_transitions.len(), 1);
}

pub(crate) fn audit_log_mirrors_the_status_history(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    store.create_job(request("s")).unwrap();
    let job = store.get_next_job(&node.node_id).unwrap();
    store.update_job_progress(&job.job_id, 50).unwrap();
    store
        .finalize_job(&job.job_id, plain_finalize(JobStatus::Completed))
        .unwrap();

    let job = store.get_job(&job.job_id).unwrap();
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
    assert!(job.state_transitions[0].from.is_none());
    for pair in job.state_transitions.windows(2) {
        assert_eq!(
            pair[1].from,
            Some(pair[0].to),
            "audit chain must be contiguous"
        );
    }
}

pub(crate) fn lookup_and_activity_primitives_work(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    let by_address = store
        .get_node_by_address("w1")
        .unwrap()
        .expect("address lookup finds the node");
    assert_eq!(by_address.node_id, node.node_id);
    assert!(store.get_node_by_address("nope").unwrap().is_none());

    let job = store.create_job(request("s")).unwrap();
    let before = store.get_job(&job.job_id).unwrap().last_activity_at;
    std::thread::sleep(std::time::Duration::from_millis(5));
    store.update_job_activity(&job.job_id).unwrap();
    let after = store.get_job(&job.job_id).unwrap().last_activity_at;
    assert!(after > before);
}

pub(crate) fn try_queue_pending_job_reports_claims(store: Arc<dyn Store>) {
    let node = store.register_node(registration("w1")).unwrap().node;
    let job = store.create_job(request("s")).unwrap();
    assert!(store.try_queue_pending_job(&job.job_id).unwrap());

    store.get_next_job(&node.node_id).unwrap();
    assert!(
        !store.try_queue_pending_job(&job.job_id).unwrap(),
        "a claimed job is no longer pending"
    );
}

macro_rules! store_contract_tests {
    ($make:expr) => {
        #[test]
        fn register_is_idempotent_by_address() {
            crate::store::testsuite::register_is_idempotent_by_address($make);
        }
        #[test]
        fn reregistration_clears_stale_claim() {
            crate::store::testsuite::reregistration_clears_stale_claim($make);
        }
        #[test]
        fn claim_moves_exactly_one_job_and_busies_the_node() {
            crate::store::testsuite::claim_moves_exactly_one_job_and_busies_the_node($make);
        }
        #[test]
        fn dispatch_order_is_queue_priority_fifo() {
            crate::store::testsuite::dispatch_order_is_queue_priority_fifo($make);
        }
        #[test]
        fn capability_filter_skips_unqualified_nodes() {
            crate::store::testsuite::capability_filter_skips_unqualified_nodes($make);
        }
        #[test]
        fn concurrent_claims_assign_each_job_once() {
            crate::store::testsuite::concurrent_claims_assign_each_job_once($make);
        }
        #[test]
        fn cancel_running_job_frees_the_worker() {
            crate::store::testsuite::cancel_running_job_frees_the_worker($make);
        }
        #[test]
        fn pause_parks_and_resume_requeues() {
            crate::store::testsuite::pause_parks_and_resume_requeues($make);
        }
        #[test]
        fn reassign_orphans_requeues_with_retry_accounting() {
            crate::store::testsuite::reassign_orphans_requeues_with_retry_accounting($make);
        }
        #[test]
        fn reassign_exhausts_into_platform_failure() {
            crate::store::testsuite::reassign_exhausts_into_platform_failure($make);
        }
        #[test]
        fn heartbeat_touches_current_job_activity() {
            crate::store::testsuite::heartbeat_touches_current_job_activity($make);
        }
        #[test]
        fn busy_nodes_cannot_be_deleted() {
            crate::store::testsuite::busy_nodes_cannot_be_deleted($make);
        }
        #[test]
        fn sequence_numbers_are_monotone_and_resolvable() {
            crate::store::testsuite::sequence_numbers_are_monotone_and_resolvable($make);
        }
        #[test]
        fn finalize_is_idempotent_for_terminal_jobs() {
            crate::store::testsuite::finalize_is_idempotent_for_terminal_jobs($make);
        }
        #[test]
        fn invalid_edges_are_rejected() {
            crate::store::testsuite::invalid_edges_are_rejected($make);
        }
        #[test]
        fn audit_log_mirrors_the_status_history() {
            crate::store::testsuite::audit_log_mirrors_the_status_history($make);
        }
        #[test]
        fn lookup_and_activity_primitives_work() {
            crate::store::testsuite::lookup_and_activity_primitives_work($make);
        }
        #[test]
        fn try_queue_pending_job_reports_claims() {
            crate::store::testsuite::try_queue_pending_job_reports_claims($make);
        }
    };
}

mod memory_contract {
    use std::sync::Arc;

    fn make() -> Arc<dyn crate::store::Store> {
        Arc::new(crate::store::MemoryStore::default())
    }

    store_contract_tests!(make());
}

mod sqlite_contract {
    use std::sync::Arc;

    fn make() -> Arc<dyn crate::store::Store> {
        Arc::new(crate::store::SqliteStore::open_in_memory().expect("in-memory sqlite opens"))
    }

    store_contract_tests!(make());
}
