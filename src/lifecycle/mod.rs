//! Job lifecycle: the state graph, transition validation and per-job
//! timeout computation. Retry and SLA policy live in the submodules.

mod retry;
mod sla;

pub use retry::RetryPolicy;
pub use sla::{SlaTargets, SlaVerdict, evaluate_platform_sla, is_sla_worthy};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::{EngineKind, JobParameters};

/// Ceiling for jobs stuck in `assigned` before a worker reports progress.
pub const ASSIGNED_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Fallback processing timeout when no media duration is known.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// ffmpeg jobs get twice the media duration before they are declared stuck.
pub const FFMPEG_SAFETY_FACTOR: f64 = 2.0;
/// gstreamer pipelines flush quickly; a flat grace period is enough.
pub const GSTREAMER_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker. Legacy rows may still say `pending`.
    #[serde(alias = "pending")]
    Queued,
    /// Claimed by a worker, engine not confirmed running yet. Legacy
    /// `paused` rows collapse here before validation.
    #[serde(alias = "paused")]
    Assigned,
    #[serde(alias = "processing")]
    Running,
    /// Parked: waiting for a retry backoff to elapse, or held by pause.
    Retrying,
    Completed,
    Failed,
    #[serde(rename = "timed_out")]
    TimedOut,
    #[serde(alias = "cancelled")]
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Parse a stored status string, normalizing legacy spellings.
    pub fn parse(s: &str) -> Option<JobStatus> {
        Some(match s {
            "queued" | "pending" => JobStatus::Queued,
            "assigned" | "paused" => JobStatus::Assigned,
            "running" | "processing" => JobStatus::Running,
            "retrying" => JobStatus::Retrying,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "timed_out" => JobStatus::TimedOut,
            "canceled" | "cancelled" => JobStatus::Canceled,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// A worker currently owns the job.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::Running)
    }

    pub fn can_retry(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::TimedOut)
    }

    /// Allowed outgoing edges of the state graph.
    pub fn allowed_targets(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Queued => &[Assigned, Canceled, Retrying],
            Assigned => &[Running, Retrying, Failed, Canceled, TimedOut],
            Running => &[Completed, Failed, TimedOut, Retrying, Canceled],
            Retrying => &[Queued, Failed, Canceled],
            TimedOut => &[Retrying, Failed],
            Completed | Failed | Canceled => &[],
        }
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        self.allowed_targets().contains(&to)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid_transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Validate a single edge against the state graph.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), InvalidTransition> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// Compute the absolute timeout for a job entering `status` at `now`.
///
/// `assigned` gets a fixed ceiling so a claim that never starts running is
/// reaped quickly. Once running, the timeout scales with the declared media
/// duration per engine; jobs without a duration fall back to the default.
pub fn compute_timeout_at(
    status: JobStatus,
    engine: EngineKind,
    parameters: &JobParameters,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let budget = match status {
        JobStatus::Assigned => ASSIGNED_TIMEOUT,
        _ => processing_budget(engine, parameters),
    };
    now + chrono::Duration::from_std(budget).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn processing_budget(engine: EngineKind, parameters: &JobParameters) -> Duration {
    let duration = crate::domain::job::duration_seconds(parameters);
    match (engine, duration) {
        (EngineKind::Ffmpeg | EngineKind::Auto, Some(d)) if d > 0.0 => {
            Duration::from_secs_f64(d * FFMPEG_SAFETY_FACTOR)
        }
        (EngineKind::Gstreamer, Some(d)) if d > 0.0 => {
            Duration::from_secs_f64(d) + GSTREAMER_GRACE
        }
        _ => DEFAULT_TIMEOUT,
    }
}
