use std::time::Duration;

use crate::domain::job::Job;
use crate::lifecycle::JobStatus;

/// Retry reasons that are always retryable regardless of job state,
/// because the worker (not the workload) went away.
const INFRASTRUCTURE_REASONS: &[&str] = &["worker_died", "worker_timeout"];

/// Retry policy: bounded attempts with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `retry_count + 1`. The first retry waits the
    /// initial backoff; each further retry doubles it, capped.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(31);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp as i32);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }

    /// Whether the job should get another attempt for the given reason.
    pub fn should_retry(&self, job: &Job, reason: &str) -> bool {
        if job.status == JobStatus::Canceled {
            return false;
        }
        if job.retry_count >= self.max_retries {
            return false;
        }
        if job
            .error
            .as_deref()
            .is_some_and(|e| e.contains("non-retryable"))
        {
            return false;
        }
        job.status.can_retry() || INFRASTRUCTURE_REASONS.contains(&reason)
    }
}
