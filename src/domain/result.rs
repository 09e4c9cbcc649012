use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::FailureReason;
use crate::lifecycle::JobStatus;

/// Result ingest payload (`POST /results`), sent by the agent exactly once
/// per finished run. The master owns all state transitions; this is a
/// report, not a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub node_id: String,
    /// Terminal outcome the worker observed: `completed`, `failed`,
    /// `timed_out` or `canceled`.
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_sla_compliant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_sla_reason: Option<String>,
}

impl JobResult {
    pub fn success(job_id: &str, node_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            node_id: node_id.to_string(),
            status: JobStatus::Completed,
            progress: Some(100),
            error: None,
            failure_reason: None,
            logs: Vec::new(),
            completed_at: Utc::now(),
            platform_sla_compliant: None,
            platform_sla_reason: None,
        }
    }

    pub fn failure(
        job_id: &str,
        node_id: &str,
        reason: FailureReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            node_id: node_id.to_string(),
            status: JobStatus::Failed,
            progress: None,
            error: Some(error.into()),
            failure_reason: Some(reason),
            logs: Vec::new(),
            completed_at: Utc::now(),
            platform_sla_compliant: None,
            platform_sla_reason: None,
        }
    }
}
