use serde::{Deserialize, Serialize};

use crate::domain::job::{Classification, FailureReason, Job, Priority, QueueClass, duration_seconds};

/// Minimum media duration for an implicitly SLA-worthy job. Shorter clips
/// are treated as smoke tests.
const MIN_SLA_DURATION_SECONDS: f64 = 10.0;

/// Platform service objective targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaTargets {
    /// Maximum time a job may sit queued before a worker starts it.
    pub max_queue_time_seconds: i64,
    /// Maximum processing time once started.
    pub max_processing_seconds: i64,
}

impl Default for SlaTargets {
    fn default() -> Self {
        Self {
            max_queue_time_seconds: 30,
            max_processing_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaVerdict {
    pub compliant: bool,
    pub reason: Option<String>,
}

impl SlaVerdict {
    fn violation(reason: impl Into<String>) -> Self {
        Self {
            compliant: false,
            reason: Some(reason.into()),
        }
    }

    fn compliant() -> Self {
        Self {
            compliant: true,
            reason: None,
        }
    }
}

/// Whether platform failures on this job count against the service
/// objective. Explicit classification wins; otherwise heuristics filter
/// out test traffic and best-effort batch work.
pub fn is_sla_worthy(job: &Job) -> bool {
    if let Some(classification) = job.classification {
        return classification == Classification::Production;
    }

    let scenario = job.scenario.to_ascii_lowercase();
    if ["test", "debug", "benchmark"]
        .iter()
        .any(|p| scenario.starts_with(p))
    {
        return false;
    }

    if duration_seconds(&job.parameters).is_none_or(|d| d < MIN_SLA_DURATION_SECONDS) {
        return false;
    }

    !(job.queue == QueueClass::Batch && job.priority == Priority::Low)
}

/// Judge a finished job against the platform targets.
///
/// Only platform-attributable causes violate: slow queueing, slow
/// processing, platform/resource failures, and timeouts that blew through
/// the processing cap. Engine and user failures are charged externally.
pub fn evaluate_platform_sla(job: &Job, targets: &SlaTargets) -> SlaVerdict {
    let queue_seconds = job
        .started_at
        .map(|started| (started - job.created_at).num_seconds())
        .unwrap_or(0);
    if queue_seconds > targets.max_queue_time_seconds {
        return SlaVerdict::violation(format!(
            "queue time {queue_seconds}s exceeded {}s",
            targets.max_queue_time_seconds
        ));
    }

    let processing_seconds = match (job.started_at, job.completed_at) {
        (Some(started), Some(completed)) => (completed - started).num_seconds(),
        _ => 0,
    };

    match job.failure_reason {
        Some(FailureReason::PlatformError) => {
            return SlaVerdict::violation("platform error");
        }
        Some(FailureReason::ResourceError) => {
            return SlaVerdict::violation("resource governance failure");
        }
        Some(FailureReason::Timeout) if processing_seconds > targets.max_processing_seconds => {
            return SlaVerdict::violation(format!(
                "timed out after {processing_seconds}s (cap {}s)",
                targets.max_processing_seconds
            ));
        }
        _ => {}
    }

    if processing_seconds > targets.max_processing_seconds {
        return SlaVerdict::violation(format!(
            "processing time {processing_seconds}s exceeded {}s",
            targets.max_processing_seconds
        ));
    }

    SlaVerdict::compliant()
}
