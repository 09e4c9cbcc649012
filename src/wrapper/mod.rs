//! Non-owning process governance.
//!
//! The wrapper starts (or adopts) a workload, puts it under cgroup
//! limits, observes it until it terminates, and records one immutable
//! [`ExecResult`]. Operational rules:
//!
//! 1. If the wrapper dies, the workload keeps running. Run-mode children
//!    get their own session via `setsid`, nothing is killed on drop, and
//!    there is no shared fate with this process.
//! 2. When uncertain, do less: state we did not observe is never
//!    synthesized (attach mode reports no exit code, period).
//! 3. Nothing irreversible happens unless explicitly requested; the only
//!    kill path is [`GovernedProcess::terminate`].

pub mod cgroup;
pub mod observe;

pub use cgroup::{Cgroup, CgroupLimits};
pub use observe::{ObserverSnapshot, WrapperObserver};

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    #[error("failed to spawn workload: {0}")]
    Spawn(std::io::Error),
    #[error("no such process: {0}")]
    NoSuchProcess(u32),
    #[error("cgroup governance failed: {0}")]
    Cgroup(String),
    #[error("empty argv")]
    EmptyCommand,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GovernMode {
    Run,
    Attach,
}

/// Layer 1: the single source of truth for one governed execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecResult {
    pub job_id: String,
    pub pid: u32,
    /// `None` in attach mode (a non-parent cannot observe the status) or
    /// when the workload died to a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub mode: GovernMode,
    pub platform_sla_compliant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_sla_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WrapperConfig {
    /// Parent cgroup for per-job groups; `None` disables governance.
    pub cgroup_root: Option<PathBuf>,
    pub limits: CgroupLimits,
}

/// One workload under governance.
#[derive(Debug)]
pub struct GovernedProcess {
    job_id: String,
    pid: u32,
    mode: GovernMode,
    child: Option<Child>,
    cgroup: Option<Cgroup>,
    /// Governance degradation (cgroup create/attach failed). The workload
    /// keeps running; the result is marked non-compliant.
    governance_error: Option<String>,
    started: Instant,
}

impl GovernedProcess {
    /// Run mode: spawn `argv` as a child in its own session and process
    /// group, stderr piped for the caller to pump, stdout discarded.
    pub fn run(
        job_id: &str,
        argv: &[String],
        config: &WrapperConfig,
    ) -> Result<Self, WrapperError> {
        let (program, args) = argv.split_first().ok_or(WrapperError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New session, new process group: the workload must survive a
            // wrapper crash, and group signalling must never hit us.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(WrapperError::Spawn)?;
        let pid = child.id();
        debug!(job_id, pid, "workload spawned");

        let mut process = Self {
            job_id: job_id.to_string(),
            pid,
            mode: GovernMode::Run,
            child: Some(child),
            cgroup: None,
            governance_error: None,
            started: Instant::now(),
        };
        process.govern(config);
        Ok(process)
    }

    /// Attach mode: adopt a pre-existing pid.
    pub fn attach(job_id: &str, pid: u32, config: &WrapperConfig) -> Result<Self, WrapperError> {
        if !process_alive(pid) {
            return Err(WrapperError::NoSuchProcess(pid));
        }
        let mut process = Self {
            job_id: job_id.to_string(),
            pid,
            mode: GovernMode::Attach,
            child: None,
            cgroup: None,
            governance_error: None,
            started: Instant::now(),
        };
        process.govern(config);
        Ok(process)
    }

    /// Apply cgroup limits. Failure degrades to ungoverned execution and
    /// taints the result; it never stops the workload.
    fn govern(&mut self, config: &WrapperConfig) {
        let Some(root) = config.cgroup_root.as_deref() else {
            return;
        };
        let name = format!("job-{}", self.job_id);
        let outcome = Cgroup::create(root, &name, &config.limits)
            .and_then(|group| group.add_process(self.pid).map(|()| group));
        match outcome {
            Ok(group) => self.cgroup = Some(group),
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "cgroup governance degraded");
                self.governance_error = Some(e.to_string());
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn mode(&self) -> GovernMode {
        self.mode
    }

    pub fn governance_error(&self) -> Option<&str> {
        self.governance_error.as_deref()
    }

    /// Stderr handle for the caller's pump thread (run mode, once).
    pub fn take_stderr(&mut self) -> Option<std::process::ChildStderr> {
        self.child.as_mut().and_then(|c| c.stderr.take())
    }

    /// Non-blocking poll: `Some(exit_code)` when the workload terminated.
    /// In attach mode termination is observable but the status is not, so
    /// the inner option stays `None`.
    pub fn try_wait(&mut self) -> Result<Option<Option<i32>>, WrapperError> {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Ok(Some(exit_code_of(status))),
                Ok(None) => Ok(None),
                Err(e) => Err(WrapperError::Spawn(e)),
            },
            None => {
                if process_alive(self.pid) {
                    Ok(None)
                } else {
                    Ok(Some(None))
                }
            }
        }
    }

    /// Explicit termination of the whole process group (cancel or timeout
    /// preemption). SIGTERM first; callers escalate with `kill` after a
    /// grace period if needed.
    #[cfg(unix)]
    pub fn terminate(&self) {
        signal_group(self.pid, libc::SIGTERM);
    }

    #[cfg(unix)]
    pub fn kill(&self) {
        signal_group(self.pid, libc::SIGKILL);
    }

    #[cfg(not(unix))]
    pub fn terminate(&self) {}

    #[cfg(not(unix))]
    pub fn kill(&self) {}

    /// Seal the execution into its immutable result and clean up the
    /// per-job cgroup (only if we own it and it is empty).
    pub fn into_result(mut self, exit_code: Option<i32>) -> ExecResult {
        // Reap the zombie if we were the parent; nothing is killed here.
        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
        let (compliant, reason) = match &self.governance_error {
            Some(e) => (false, Some(format!("resource governance failure: {e}"))),
            None => (true, None),
        };
        if let Some(group) = &self.cgroup {
            group.remove_if_owned();
        }
        ExecResult {
            job_id: self.job_id.clone(),
            pid: self.pid,
            exit_code,
            duration: self.started.elapsed(),
            mode: self.mode,
            platform_sla_compliant: compliant,
            platform_sla_reason: reason,
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    // A signal death has no exit code; rule 2 says do not invent one.
    status.code()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // Negative pid addresses the whole process group created by setsid.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn ungoverned() -> WrapperConfig {
        WrapperConfig::default()
    }

    fn wait_for_exit(process: &mut GovernedProcess) -> Option<i32> {
        for _ in 0..200 {
            if let Some(code) = process.try_wait().expect("try_wait") {
                return code;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        panic!("workload did not terminate in time");
    }

    #[test]
    fn run_mode_records_the_exit_code() {
        let mut p = GovernedProcess::run("t-exit", &sh("exit 3"), &ungoverned()).unwrap();
        let code = wait_for_exit(&mut p);
        assert_eq!(code, Some(3));
        let result = p.into_result(code);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.mode, GovernMode::Run);
        assert!(result.platform_sla_compliant);
    }

    #[test]
    fn empty_argv_is_rejected() {
        let err = GovernedProcess::run("t-empty", &[], &ungoverned()).unwrap_err();
        assert!(matches!(err, WrapperError::EmptyCommand));
    }

    #[test]
    fn attach_mode_observes_termination_without_an_exit_code() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 0.2"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();

        let mut p = GovernedProcess::attach("t-attach", pid, &ungoverned()).unwrap();
        assert!(p.try_wait().unwrap().is_none(), "still running");

        child.wait().unwrap();
        let code = wait_for_exit(&mut p);
        assert_eq!(code, None, "attach mode must not synthesize an exit code");
        let result = p.into_result(code);
        assert_eq!(result.mode, GovernMode::Attach);
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn attach_to_a_dead_pid_fails() {
        // Spawn and reap so the pid is gone.
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let err = GovernedProcess::attach("t-dead", pid, &ungoverned());
        assert!(matches!(err, Err(WrapperError::NoSuchProcess(_))));
    }

    #[test]
    fn workload_survives_wrapper_drop() {
        let mut p = GovernedProcess::run("t-survive", &sh("sleep 5"), &ungoverned()).unwrap();
        let pid = p.pid();
        // Forget the child handle entirely: dropping the wrapper state
        // must not signal the workload.
        p.child = None;
        drop(p);

        std::thread::sleep(Duration::from_millis(100));
        assert!(process_alive(pid), "workload must outlive the wrapper");

        // Clean up after ourselves.
        signal_group(pid, libc::SIGKILL);
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
            libc::waitpid(pid as libc::pid_t, std::ptr::null_mut(), libc::WNOHANG);
        }
    }

    #[test]
    fn terminate_stops_the_whole_group() {
        let mut p =
            GovernedProcess::run("t-term", &sh("sleep 30 & sleep 30; wait"), &ungoverned())
                .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        p.terminate();
        let code = wait_for_exit(&mut p);
        assert_eq!(code, None, "SIGTERM death carries no exit code");
    }

    #[test]
    fn governance_failure_taints_the_result_but_not_the_run() {
        let config = WrapperConfig {
            // A root nothing can create groups under.
            cgroup_root: Some(PathBuf::from("/proc/definitely-not-writable")),
            limits: CgroupLimits {
                cpu_max_percent: Some(100),
                ..Default::default()
            },
        };
        let mut p = GovernedProcess::run("t-degraded", &sh("exit 0"), &config).unwrap();
        assert!(p.governance_error().is_some());
        let code = wait_for_exit(&mut p);
        assert_eq!(code, Some(0), "workload ran to completion regardless");
        let result = p.into_result(code);
        assert!(!result.platform_sla_compliant);
        assert!(
            result
                .platform_sla_reason
                .as_deref()
                .unwrap()
                .contains("resource governance failure")
        );
    }
}
