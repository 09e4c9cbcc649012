//! Dispatch selection: which queued job does a polling worker get.
//!
//! Pure functions only; the atomic claim itself lives in the stores so it
//! can share their transaction scope.

use crate::domain::job::required_gpu_capability;
use crate::domain::{EngineKind, Job, Node};
use crate::lifecycle::JobStatus;

/// Whether the node's advertised capabilities satisfy the job.
///
/// Codec requirements are strict: a job that resolves to a GPU-only
/// encoder only runs on nodes advertising the matching tag. Engine
/// requirements are enforced when the node advertises an engine set at
/// all; nodes registered without the `engines` label are assumed capable
/// (capability unknown is not capability absent).
pub fn node_satisfies(job: &Job, node: &Node) -> bool {
    if let Some(tag) = required_gpu_capability(&job.parameters) {
        if !node.capabilities.has_gpu_capability(tag) {
            return false;
        }
    }

    let required_engine = match job.engine {
        EngineKind::Ffmpeg => Some("ffmpeg"),
        EngineKind::Gstreamer => Some("gstreamer"),
        EngineKind::Auto => None,
    };
    if let Some(engine) = required_engine {
        let advertised = node.capabilities.engines();
        if !advertised.is_empty() && !advertised.iter().any(|e| e == engine) {
            return false;
        }
    }

    true
}

/// Select the job a claim should take: highest-ranked queued job the node
/// satisfies, ordered by `(queue rank, priority rank, created_at)`.
///
/// A higher-ranked job the node cannot satisfy is skipped, not blocking:
/// it stays queued for a capable worker.
pub fn select_candidate<'a, I>(jobs: I, node: &Node) -> Option<&'a Job>
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut queued: Vec<&Job> = jobs
        .into_iter()
        .filter(|j| j.status == JobStatus::Queued && j.node_id.is_empty())
        .collect();
    queued.sort_by_key(|j| j.dispatch_key());
    queued.into_iter().find(|j| node_satisfies(j, node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobRequest, NodeRegistration, NodeType, Priority, QueueClass};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn node_with(gpu_caps: Vec<String>, engines: Option<&str>) -> Node {
        let mut labels = BTreeMap::new();
        if let Some(e) = engines {
            labels.insert("engines".to_string(), e.to_string());
        }
        Node::from_registration(NodeRegistration {
            address: "w".into(),
            node_type: NodeType::Desktop,
            name: None,
            cpu_threads: 8,
            cpu_model: "cpu".into(),
            has_gpu: !gpu_caps.is_empty(),
            gpu_type: None,
            gpu_capabilities: gpu_caps,
            ram_total_bytes: 0,
            labels,
        })
    }

    fn job(queue: QueueClass, priority: Priority) -> Job {
        let mut req = JobRequest::for_scenario("s");
        req.queue = queue;
        req.priority = priority;
        Job::from_request(req, 0)
    }

    #[test]
    fn ordering_is_queue_then_priority_then_fifo() {
        let a = job(QueueClass::Batch, Priority::High);
        let b = job(QueueClass::Default, Priority::Low);
        let c = job(QueueClass::Default, Priority::Medium);
        let d = job(QueueClass::Live, Priority::Low);

        let node = node_with(Vec::new(), None);
        let jobs = [&a, &b, &c, &d];
        let picked = select_candidate(jobs.iter().copied(), &node).unwrap();
        assert_eq!(picked.job_id, d.job_id, "live queue outranks everything");
    }

    #[test]
    fn hevc_jobs_skip_nodes_without_the_encoder() {
        let mut req = JobRequest::for_scenario("4K60-h264");
        req.parameters.insert("codec".into(), json!("h265"));
        let gpu_job = Job::from_request(req, 1);

        let plain = node_with(Vec::new(), None);
        assert!(!node_satisfies(&gpu_job, &plain));

        let nvenc = node_with(vec!["nvenc_hevc".into()], None);
        assert!(node_satisfies(&gpu_job, &nvenc));
    }

    #[test]
    fn unmatched_high_rank_job_does_not_block_lower_ranks() {
        let mut req = JobRequest::for_scenario("gpu-job");
        req.queue = QueueClass::Live;
        req.parameters.insert("codec".into(), json!("hevc"));
        let gpu_job = Job::from_request(req, 1);
        let cpu_job = job(QueueClass::Batch, Priority::Low);

        let plain = node_with(Vec::new(), None);
        let jobs = [&gpu_job, &cpu_job];
        let picked = select_candidate(jobs.iter().copied(), &plain).unwrap();
        assert_eq!(picked.job_id, cpu_job.job_id);
    }

    #[test]
    fn engine_requirement_binds_only_when_advertised() {
        let mut req = JobRequest::for_scenario("s");
        req.engine = crate::domain::EngineKind::Gstreamer;
        let gst_job = Job::from_request(req, 1);

        let unlabeled = node_with(Vec::new(), None);
        assert!(
            node_satisfies(&gst_job, &unlabeled),
            "nodes without an engines label are assumed capable"
        );

        let ffmpeg_only = node_with(Vec::new(), Some("ffmpeg"));
        assert!(!node_satisfies(&gst_job, &ffmpeg_only));

        let both = node_with(Vec::new(), Some("ffmpeg,gstreamer"));
        assert!(node_satisfies(&gst_job, &both));
    }
}
