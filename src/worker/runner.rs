//! Per-job execution on the worker: build the argv, run it under the
//! wrapper, pump stderr, report progress, preempt on cancel/timeout, and
//! ship exactly one result to the master.

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::domain::job::{FailureReason, Job, required_gpu_capability};
use crate::domain::result::JobResult;
use crate::lifecycle::JobStatus;
use crate::worker::client::MasterClient;
use crate::worker::engine_cmd::{self, CommandError};
use crate::wrapper::{CgroupLimits, GovernedProcess, WrapperConfig, WrapperObserver};

/// How often the supervision loop wakes to drain stderr and poll exit.
const SUPERVISE_POLL: Duration = Duration::from_millis(250);
/// How often progress goes to the master (also the cancel observation
/// channel, so keep it well under the heartbeat interval).
const PROGRESS_REPORT_EVERY: Duration = Duration::from_secs(2);
/// Grace between SIGTERM and SIGKILL when preempting.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// Rolling window of engine stderr shipped with the result.
const MAX_RESULT_LOG_LINES: usize = 500;

pub struct RunContext {
    pub client: Arc<MasterClient>,
    pub node_id: String,
    pub engines: Vec<String>,
    pub gpu_present: bool,
    pub cgroup_root: Option<std::path::PathBuf>,
    pub observer: Arc<WrapperObserver>,
}

/// Execute one claimed job end to end. Always ends in a result submission
/// unless the master already finalized the job out from under us.
pub async fn execute_job(ctx: &RunContext, job: Job) {
    let job_id = job.job_id.clone();
    info!(job_id = %job_id, scenario = %job.scenario, "starting claimed job");

    let engine = engine_cmd::resolve_engine(&job, &ctx.engines);
    let use_gpu = ctx.gpu_present && required_gpu_capability(&job.parameters).is_some();
    let argv = match engine_cmd::build_argv(&job, engine, use_gpu) {
        Ok(argv) => argv,
        Err(e) => {
            // Bad submission parameters never start an engine.
            let reason = match e {
                CommandError::InvalidParameter { .. } | CommandError::UnsupportedCodec(_) => {
                    FailureReason::UserError
                }
            };
            submit_with_retry(
                ctx,
                JobResult::failure(&job_id, &ctx.node_id, reason, e.to_string()),
            )
            .await;
            return;
        }
    };

    let wrapper_config = WrapperConfig {
        cgroup_root: ctx.cgroup_root.clone(),
        limits: limits_from_parameters(&job),
    };

    let mut process = match GovernedProcess::run(&job_id, &argv, &wrapper_config) {
        Ok(p) => p,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "failed to start engine");
            submit_with_retry(
                ctx,
                JobResult::failure(&job_id, &ctx.node_id, FailureReason::ResourceError, e.to_string()),
            )
            .await;
            return;
        }
    };
    ctx.observer.record_started(process.mode());

    let stderr_rx = spawn_stderr_pump(&mut process);
    let outcome = supervise(ctx, &job, &mut process, stderr_rx).await;

    let exec = process.into_result(outcome.exit_code);
    ctx.observer.record(&exec);

    let mut result = match outcome.kind {
        OutcomeKind::Completed => JobResult::success(&job_id, &ctx.node_id),
        OutcomeKind::Canceled => JobResult {
            status: JobStatus::Canceled,
            ..JobResult::success(&job_id, &ctx.node_id)
        },
        OutcomeKind::TimedOut => {
            let mut r = JobResult::failure(
                &job_id,
                &ctx.node_id,
                FailureReason::Timeout,
                "engine preempted at timeout",
            );
            r.status = JobStatus::TimedOut;
            r
        }
        OutcomeKind::Failed(reason, error) => {
            JobResult::failure(&job_id, &ctx.node_id, reason, error)
        }
        OutcomeKind::MasterFinalized => {
            debug!(job_id = %job_id, "master finalized the job; nothing to report");
            return;
        }
    };
    result.progress = Some(outcome.progress);
    result.logs = outcome.logs;
    if !exec.platform_sla_compliant {
        // Governance degraded underneath the engine; that verdict travels
        // with the result so the master charges the platform.
        result.platform_sla_compliant = Some(false);
        result.platform_sla_reason = exec.platform_sla_reason.clone();
        if result.status == JobStatus::Completed {
            result.status = JobStatus::Failed;
            result.failure_reason = Some(FailureReason::ResourceError);
            result.error = exec.platform_sla_reason.clone();
        }
    }

    submit_with_retry(ctx, result).await;
}

enum OutcomeKind {
    Completed,
    Canceled,
    TimedOut,
    Failed(FailureReason, String),
    /// The master's view went terminal without us; do not report.
    MasterFinalized,
}

struct Outcome {
    kind: OutcomeKind,
    exit_code: Option<i32>,
    progress: u8,
    logs: Vec<String>,
}

async fn supervise(
    ctx: &RunContext,
    job: &Job,
    process: &mut GovernedProcess,
    stderr_rx: Option<mpsc::Receiver<String>>,
) -> Outcome {
    let duration_hint = crate::domain::job::duration_seconds(&job.parameters);
    let mut timeout_at = job.timeout_at;
    let mut logs: Vec<String> = Vec::new();
    let mut progress: u8 = 0;
    let mut last_report = Instant::now()
        .checked_sub(PROGRESS_REPORT_EVERY)
        .unwrap_or_else(Instant::now);

    loop {
        // Drain whatever the engine said since the last wake-up.
        if let Some(rx) = &stderr_rx {
            while let Ok(line) = rx.try_recv() {
                if let Some(p) = parse_progress_percent(&line, duration_hint) {
                    progress = p;
                }
                push_bounded(&mut logs, line);
            }
        }

        if last_report.elapsed() >= PROGRESS_REPORT_EVERY {
            last_report = Instant::now();
            match ctx.client.report_progress(&job.job_id, progress).await {
                Ok(view) => {
                    // The master's row is authoritative; this is where a
                    // cancellation (or a scheduler-side timeout) reaches us.
                    timeout_at = view.timeout_at.or(timeout_at);
                    match view.status {
                        JobStatus::Canceled => {
                            info!(job_id = %job.job_id, "cancellation observed; terminating engine");
                            let code = preempt(process).await;
                            return Outcome {
                                kind: OutcomeKind::Canceled,
                                exit_code: code,
                                progress,
                                logs,
                            };
                        }
                        s if s.is_terminal() || s == JobStatus::Retrying => {
                            let code = preempt(process).await;
                            return Outcome {
                                kind: OutcomeKind::MasterFinalized,
                                exit_code: code,
                                progress,
                                logs,
                            };
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    // Master unreachable; keep transcoding. The heartbeat
                    // task worries about liveness.
                    debug!(job_id = %job.job_id, error = %e, "progress report failed");
                }
            }
        }

        if let Some(deadline) = timeout_at {
            if Utc::now() > deadline {
                warn!(job_id = %job.job_id, "timeout reached; preempting engine");
                let code = preempt(process).await;
                return Outcome {
                    kind: OutcomeKind::TimedOut,
                    exit_code: code,
                    progress,
                    logs,
                };
            }
        }

        match process.try_wait() {
            Ok(Some(code)) => {
                // Flush the tail of stderr before judging the exit.
                if let Some(rx) = &stderr_rx {
                    while let Ok(line) = rx.try_recv() {
                        if let Some(p) = parse_progress_percent(&line, duration_hint) {
                            progress = p;
                        }
                        push_bounded(&mut logs, line);
                    }
                }
                let kind = match code {
                    Some(0) => {
                        progress = 100;
                        OutcomeKind::Completed
                    }
                    _ => {
                        let reason = classify_failure(&logs);
                        let detail = match code {
                            Some(c) => format!("engine exited with status {c}"),
                            None => "engine terminated by signal".to_string(),
                        };
                        OutcomeKind::Failed(reason, detail)
                    }
                };
                return Outcome {
                    kind,
                    exit_code: code,
                    progress,
                    logs,
                };
            }
            Ok(None) => {}
            Err(e) => {
                return Outcome {
                    kind: OutcomeKind::Failed(
                        FailureReason::PlatformError,
                        format!("lost track of the engine process: {e}"),
                    ),
                    exit_code: None,
                    progress,
                    logs,
                };
            }
        }

        tokio::time::sleep(SUPERVISE_POLL).await;
    }
}

/// SIGTERM, a grace period, then SIGKILL. Returns the observed exit code.
async fn preempt(process: &mut GovernedProcess) -> Option<i32> {
    process.terminate();
    let deadline = Instant::now() + TERMINATE_GRACE;
    loop {
        match process.try_wait() {
            Ok(Some(code)) => return code,
            Ok(None) => {
                if Instant::now() >= deadline {
                    process.kill();
                }
            }
            Err(_) => return None,
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn spawn_stderr_pump(process: &mut GovernedProcess) -> Option<mpsc::Receiver<String>> {
    let stderr = process.take_stderr()?;
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("ffleet-stderr-pump".into())
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .ok()?;
    Some(rx)
}

fn push_bounded(logs: &mut Vec<String>, line: String) {
    logs.push(line);
    if logs.len() > MAX_RESULT_LOG_LINES {
        logs.remove(0);
    }
}

async fn submit_with_retry(ctx: &RunContext, result: JobResult) {
    let mut attempts: u32 = 0;
    loop {
        match ctx.client.submit_result(&result).await {
            Ok(ack) => {
                info!(
                    job_id = %result.job_id,
                    status = %result.status,
                    ack = %ack.status,
                    "result recorded"
                );
                return;
            }
            Err(e) => {
                attempts += 1;
                if attempts >= 24 {
                    warn!(
                        job_id = %result.job_id,
                        error = %e,
                        "giving up on result submission; the orphan sweep will recover the job"
                    );
                    return;
                }
                warn!(
                    job_id = %result.job_id,
                    attempt = attempts,
                    error = %e,
                    "result submission failed; retrying in 5s"
                );
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Cgroup limits ride in the parameters when the submitter wants OS-level
/// governance tighter than the node default.
fn limits_from_parameters(job: &Job) -> CgroupLimits {
    let get_u64 = |key: &str| job.parameters.get(key).and_then(|v| v.as_u64());
    CgroupLimits {
        cpu_max_percent: get_u64("cpu_limit_percent").map(|v| v as u32),
        memory_max_bytes: get_u64("memory_limit_mb").map(|v| v << 20),
        io_weight: get_u64("io_weight").map(|v| v as u16),
    }
}

// ffmpeg's -progress stream uses `out_time_ms=` (microseconds despite the
// name); the human-readable log line uses `time=HH:MM:SS.cc`.
static OUT_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"out_time_ms=(\d+)").expect("out_time pattern compiles"));
static CLOCK_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("clock pattern"));

/// Progress percent from one engine stderr line, given the media duration.
pub fn parse_progress_percent(line: &str, duration_seconds: Option<f64>) -> Option<u8> {
    let duration = duration_seconds.filter(|d| *d > 0.0)?;
    let elapsed = if let Some(caps) = OUT_TIME_RE.captures(line) {
        caps[1].parse::<f64>().ok()? / 1_000_000.0
    } else if let Some(caps) = CLOCK_TIME_RE.captures(line) {
        let hours: f64 = caps[1].parse().ok()?;
        let minutes: f64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        hours * 3600.0 + minutes * 60.0 + seconds
    } else {
        return None;
    };
    // Cap below 100: only a clean exit may claim completion.
    Some(((elapsed / duration * 100.0).min(99.0)) as u8)
}

/// Map engine stderr onto the failure taxonomy. Conservative: anything
/// unrecognized stays a retryable runtime error.
pub fn classify_failure(logs: &[String]) -> FailureReason {
    for line in logs.iter().rev() {
        let lower = line.to_ascii_lowercase();
        if lower.contains("no such file")
            || lower.contains("could not open")
            || lower.contains("invalid data found")
            || lower.contains("moov atom not found")
        {
            return FailureReason::InputError;
        }
        if lower.contains("unrecognized option")
            || lower.contains("unknown encoder")
            || lower.contains("invalid argument")
            || lower.contains("error parsing")
        {
            return FailureReason::UserError;
        }
        if lower.contains("connection refused")
            || lower.contains("network is unreachable")
            || lower.contains("temporary failure in name resolution")
        {
            return FailureReason::NetworkError;
        }
    }
    FailureReason::RuntimeError
}
