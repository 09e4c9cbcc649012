//! Observation layers over wrapper results. Layer 1 (the immutable
//! [`ExecResult`](crate::wrapper::ExecResult)) is the source of truth;
//! the counters and the violation ring here are projections derived from
//! it and must never influence control flow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::wrapper::{ExecResult, GovernMode};

/// Bounded sample of recent non-compliant results for root-cause work.
pub const VIOLATION_RING_CAPACITY: usize = 50;

/// Layer 2: monotone counters. Layer 3: the violation ring.
#[derive(Debug, Default)]
pub struct WrapperObserver {
    started: AtomicU64,
    completed: AtomicU64,
    exit_zero: AtomicU64,
    exit_nonzero: AtomicU64,
    sla_compliant: AtomicU64,
    sla_violation: AtomicU64,
    mode_run: AtomicU64,
    mode_attach: AtomicU64,
    violations: Mutex<VecDeque<ExecResult>>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObserverSnapshot {
    pub started: u64,
    pub completed: u64,
    pub exit_zero: u64,
    pub exit_nonzero: u64,
    pub sla_compliant: u64,
    pub sla_violation: u64,
    pub mode_run: u64,
    pub mode_attach: u64,
}

impl WrapperObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self, mode: GovernMode) {
        self.started.fetch_add(1, Ordering::Relaxed);
        match mode {
            GovernMode::Run => self.mode_run.fetch_add(1, Ordering::Relaxed),
            GovernMode::Attach => self.mode_attach.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record(&self, result: &ExecResult) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        match result.exit_code {
            Some(0) => {
                self.exit_zero.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {
                self.exit_nonzero.fetch_add(1, Ordering::Relaxed);
            }
            // Attach mode cannot observe an exit status; neither bucket.
            None => {}
        }
        if result.platform_sla_compliant {
            self.sla_compliant.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sla_violation.fetch_add(1, Ordering::Relaxed);
            let mut ring = self.violations.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() == VIOLATION_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(result.clone());
        }
    }

    pub fn snapshot(&self) -> ObserverSnapshot {
        ObserverSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            exit_zero: self.exit_zero.load(Ordering::Relaxed),
            exit_nonzero: self.exit_nonzero.load(Ordering::Relaxed),
            sla_compliant: self.sla_compliant.load(Ordering::Relaxed),
            sla_violation: self.sla_violation.load(Ordering::Relaxed),
            mode_run: self.mode_run.load(Ordering::Relaxed),
            mode_attach: self.mode_attach.load(Ordering::Relaxed),
        }
    }

    pub fn recent_violations(&self) -> Vec<ExecResult> {
        self.violations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

// Process-wide instance with explicit lifecycle. Binaries call `init` at
// startup and `shutdown` on exit; tests construct their own observer and
// never touch the global.

static GLOBAL: Mutex<Option<Arc<WrapperObserver>>> = Mutex::new(None);

pub fn init() -> Arc<WrapperObserver> {
    let observer = Arc::new(WrapperObserver::new());
    *GLOBAL.lock().unwrap_or_else(|e| e.into_inner()) = Some(observer.clone());
    observer
}

pub fn global() -> Option<Arc<WrapperObserver>> {
    GLOBAL.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

pub fn shutdown() {
    *GLOBAL.lock().unwrap_or_else(|e| e.into_inner()) = None;
}
