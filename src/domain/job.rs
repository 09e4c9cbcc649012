use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::JobStatus;

/// Engine knobs arrive as a free-form string map (`duration`, `bitrate`,
/// `resolution`, plus engine-specific keys). Validation to a typed shape
/// happens inside the engine command builder, not at the boundary.
pub type JobParameters = serde_json::Map<String, serde_json::Value>;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Rolling per-job log window. Oldest lines drop first.
pub const MAX_LOG_LINES: usize = 500;
pub const MAX_LOG_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Auto,
    Ffmpeg,
    Gstreamer,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Auto => "auto",
            EngineKind::Ffmpeg => "ffmpeg",
            EngineKind::Gstreamer => "gstreamer",
        }
    }

    pub fn parse(s: &str) -> Option<EngineKind> {
        Some(match s {
            "auto" => EngineKind::Auto,
            "ffmpeg" => EngineKind::Ffmpeg,
            "gstreamer" => EngineKind::Gstreamer,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Live,
    #[default]
    Default,
    Batch,
}

impl QueueClass {
    /// Primary dispatch key; lower ranks dispatch first.
    pub fn rank(self) -> u8 {
        match self {
            QueueClass::Live => 0,
            QueueClass::Default => 1,
            QueueClass::Batch => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueClass::Live => "live",
            QueueClass::Default => "default",
            QueueClass::Batch => "batch",
        }
    }

    pub fn parse(s: &str) -> Option<QueueClass> {
        Some(match s {
            "live" => QueueClass::Live,
            "default" => QueueClass::Default,
            "batch" => QueueClass::Batch,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Secondary dispatch key; lower ranks dispatch first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Priority> {
        Some(match s {
            "high" => Priority::High,
            "medium" => Priority::Medium,
            "low" => Priority::Low,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Production,
    Test,
    Benchmark,
    Debug,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Production => "production",
            Classification::Test => "test",
            Classification::Benchmark => "benchmark",
            Classification::Debug => "debug",
        }
    }

    pub fn parse(s: &str) -> Option<Classification> {
        Some(match s {
            "production" => Classification::Production,
            "test" => Classification::Test,
            "benchmark" => Classification::Benchmark,
            "debug" => Classification::Debug,
            _ => return None,
        })
    }
}

/// Structured failure cause. The worker classifies, the master records,
/// the SLA calculator charges only the platform-attributable subset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CapabilityMismatch,
    RuntimeError,
    Timeout,
    UserError,
    NetworkError,
    InputError,
    PlatformError,
    ResourceError,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::CapabilityMismatch => "capability_mismatch",
            FailureReason::RuntimeError => "runtime_error",
            FailureReason::Timeout => "timeout",
            FailureReason::UserError => "user_error",
            FailureReason::NetworkError => "network_error",
            FailureReason::InputError => "input_error",
            FailureReason::PlatformError => "platform_error",
            FailureReason::ResourceError => "resource_error",
        }
    }

    pub fn parse(s: &str) -> Option<FailureReason> {
        Some(match s {
            "capability_mismatch" => FailureReason::CapabilityMismatch,
            "runtime_error" => FailureReason::RuntimeError,
            "timeout" => FailureReason::Timeout,
            "user_error" => FailureReason::UserError,
            "network_error" => FailureReason::NetworkError,
            "input_error" => FailureReason::InputError,
            "platform_error" => FailureReason::PlatformError,
            "resource_error" => FailureReason::ResourceError,
            _ => return None,
        })
    }

    /// Causes the worker should re-attempt on a fresh claim.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureReason::RuntimeError
                | FailureReason::Timeout
                | FailureReason::NetworkError
                | FailureReason::PlatformError
                | FailureReason::ResourceError
        )
    }
}

/// Append-only audit record; written atomically with the job row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateTransition {
    /// `None` marks the synthetic initial entry at submission time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Submission payload (`POST /jobs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub scenario: String,
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default)]
    pub queue: QueueClass,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub parameters: JobParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl JobRequest {
    pub fn for_scenario(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            engine: EngineKind::default(),
            queue: QueueClass::default(),
            priority: Priority::default(),
            classification: None,
            parameters: JobParameters::new(),
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    /// Small monotone id for humans; the opaque `job_id` is the real key.
    pub sequence_number: u64,
    pub scenario: String,
    pub engine: EngineKind,
    pub parameters: JobParameters,
    pub queue: QueueClass,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,

    pub status: JobStatus,
    /// 0-100.
    pub progress: u8,
    /// Assigned worker, or empty when no worker owns the job.
    #[serde(default)]
    pub node_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    /// When a retrying job may re-enter the queue. `None` while parked by
    /// an explicit pause: only resume releases those.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// Bounded tail of engine stderr/stdout lines.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_sla_compliant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_sla_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_transitions: Vec<StateTransition>,
}

impl Job {
    /// Build a fresh queued job from a submission. The caller (store)
    /// supplies the sequence number.
    pub fn from_request(req: JobRequest, sequence_number: u64) -> Self {
        let now = Utc::now();
        let mut job = Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            sequence_number,
            scenario: req.scenario,
            engine: req.engine,
            parameters: req.parameters,
            queue: req.queue,
            priority: req.priority,
            classification: req.classification,
            status: JobStatus::Queued,
            progress: 0,
            node_id: String::new(),
            retry_count: 0,
            max_retries: req.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            created_at: now,
            started_at: None,
            last_activity_at: Some(now),
            completed_at: None,
            timeout_at: None,
            retry_at: None,
            retry_reason: None,
            error: None,
            failure_reason: None,
            logs: Vec::new(),
            platform_sla_compliant: None,
            platform_sla_reason: None,
            state_transitions: Vec::new(),
        };
        job.record_transition(None, JobStatus::Queued, "submitted");
        job
    }

    /// Append to the audit log. The store is responsible for having
    /// validated the edge first.
    pub fn record_transition(&mut self, from: Option<JobStatus>, to: JobStatus, reason: &str) {
        self.state_transitions.push(StateTransition {
            from,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        });
    }

    /// Append a log line, keeping the window bounded.
    pub fn push_log_line(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
        while self.logs.len() > MAX_LOG_LINES {
            self.logs.remove(0);
        }
        let mut total: usize = self.logs.iter().map(|l| l.len() + 1).sum();
        while total > MAX_LOG_BYTES && self.logs.len() > 1 {
            total -= self.logs[0].len() + 1;
            self.logs.remove(0);
        }
    }

    /// The dispatch ordering key: queue class, then priority, then FIFO.
    pub fn dispatch_key(&self) -> (u8, u8, DateTime<Utc>) {
        (self.queue.rank(), self.priority.rank(), self.created_at)
    }
}

/// Media duration in seconds, if the submission declared one. Accepts both
/// numeric and numeric-string values since parameters are free-form.
pub fn duration_seconds(parameters: &JobParameters) -> Option<f64> {
    match parameters.get("duration") {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Requested output codec, lowercased.
pub fn codec(parameters: &JobParameters) -> Option<String> {
    parameters
        .get("codec")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_lowercase())
}

/// GPU encoder tag the job needs, if its codec has no software fallback we
/// are willing to schedule. h264 always has one.
pub fn required_gpu_capability(parameters: &JobParameters) -> Option<&'static str> {
    match codec(parameters).as_deref() {
        Some("h265") | Some("hevc") => Some("nvenc_hevc"),
        Some("av1") => Some("nvenc_av1"),
        _ => None,
    }
}
