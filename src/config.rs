//! Binary configuration. Every flag with an environment twin is declared
//! exactly once, with the env var on the declaration, so the value has a
//! single source of truth (environment overridden by the flag).

use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Volatile catalog; fine for development and tests.
    Memory,
    /// SQLite catalog on disk.
    Sqlite,
}

/// `ffleetd`: the master daemon.
#[derive(Debug, Clone, Parser)]
#[command(name = "ffleetd", version, about = "Transcoding control plane master")]
pub struct MasterConfig {
    /// Address the control API binds to.
    #[arg(long, env = "FFLEET_BIND", default_value = "0.0.0.0:7300")]
    pub bind: String,

    /// Bearer token required on every non-health endpoint. Unset disables
    /// authentication (development only).
    #[arg(long, env = "FFLEET_API_KEY")]
    pub api_key: Option<String>,

    #[arg(long, value_enum, env = "FFLEET_STORE", default_value = "sqlite")]
    pub store: StoreKind,

    /// Catalog path when the sqlite store is selected.
    #[arg(long, env = "FFLEET_DB", default_value = "ffleet.db")]
    pub db_path: String,

    /// Housekeeping tick.
    #[arg(long, default_value_t = 5)]
    pub tick_interval_secs: u64,

    /// Expected worker heartbeat period, advertised to agents.
    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// A node silent for this long is declared offline and its jobs are
    /// reassigned (2 x heartbeat + grace).
    #[arg(long, default_value_t = 90)]
    pub node_dead_after_secs: u64,

    /// Upper safety net for running jobs whose per-job timeout never fires.
    #[arg(long, default_value_t = 1800)]
    pub stale_after_secs: u64,

    /// Platform SLA: maximum queue wait.
    #[arg(long, default_value_t = 30)]
    pub sla_max_queue_secs: i64,

    /// Platform SLA: maximum processing time.
    #[arg(long, default_value_t = 600)]
    pub sla_max_processing_secs: i64,
}

impl MasterConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn node_dead_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.node_dead_after_secs as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn sla_targets(&self) -> crate::lifecycle::SlaTargets {
        crate::lifecycle::SlaTargets {
            max_queue_time_seconds: self.sla_max_queue_secs,
            max_processing_seconds: self.sla_max_processing_secs,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        // Parse from nothing so clap defaults stay authoritative.
        Self::parse_from(["ffleetd"])
    }
}

/// `ffleet-agent`: the worker agent.
#[derive(Debug, Clone, Parser)]
#[command(name = "ffleet-agent", version, about = "Transcoding worker agent")]
pub struct AgentConfig {
    #[arg(long, env = "FFLEET_MASTER_URL", default_value = "http://127.0.0.1:7300")]
    pub master_url: String,

    #[arg(long, env = "FFLEET_API_KEY")]
    pub api_key: Option<String>,

    /// Address to register under; defaults to the hostname.
    #[arg(long, env = "FFLEET_AGENT_ADDRESS")]
    pub address: Option<String>,

    /// Human-friendly node name.
    #[arg(long, env = "FFLEET_AGENT_NAME")]
    pub name: Option<String>,

    /// How often to ask for work while capacity is free.
    #[arg(long, default_value_t = 10)]
    pub poll_interval_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Concurrent engine runs this agent allows.
    #[arg(long, default_value_t = 4)]
    pub max_concurrent_jobs: usize,

    /// Parent cgroup the wrapper creates per-job groups under. Empty
    /// disables cgroup governance (the engines still run, unlimited).
    #[arg(long, env = "FFLEET_CGROUP_ROOT", default_value = "/sys/fs/cgroup/ffleet")]
    pub cgroup_root: String,
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_defaults_are_sane() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.tick_interval_secs, 5);
        assert_eq!(cfg.node_dead_after_secs, 90);
        assert_eq!(cfg.sla_targets().max_queue_time_seconds, 30);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = MasterConfig::parse_from([
            "ffleetd",
            "--bind",
            "127.0.0.1:9000",
            "--store",
            "memory",
            "--tick-interval-secs",
            "1",
        ]);
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.store, StoreKind::Memory);
        assert_eq!(cfg.tick_interval(), Duration::from_secs(1));
    }
}
