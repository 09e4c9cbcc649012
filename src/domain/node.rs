use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label key under which the agent advertises its detected engines
/// (comma-joined, e.g. `"ffmpeg,gstreamer"`). The registration wire shape
/// has no dedicated field for engines, so they ride in the labels.
pub const ENGINES_LABEL: &str = "engines";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Laptop,
    #[default]
    Desktop,
    Server,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Laptop => "laptop",
            NodeType::Desktop => "desktop",
            NodeType::Server => "server",
        }
    }

    pub fn parse(s: &str) -> Option<NodeType> {
        Some(match s {
            "laptop" => NodeType::Laptop,
            "desktop" => NodeType::Desktop,
            "server" => NodeType::Server,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Available,
    Busy,
    Offline,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Available => "available",
            NodeStatus::Busy => "busy",
            NodeStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<NodeStatus> {
        Some(match s {
            "available" => NodeStatus::Available,
            "busy" => NodeStatus::Busy,
            "offline" => NodeStatus::Offline,
            _ => return None,
        })
    }
}

/// Hardware surface detected by the agent at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NodeCapabilities {
    pub cpu_threads: u32,
    pub cpu_model: String,
    pub ram_total_bytes: u64,
    pub has_gpu: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    /// Ordered encoder tags, e.g. `nvenc_h264`, `nvenc_hevc`.
    #[serde(default)]
    pub gpu_capabilities: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodeCapabilities {
    pub fn has_gpu_capability(&self, tag: &str) -> bool {
        self.gpu_capabilities.iter().any(|c| c == tag)
    }

    /// Engines advertised via the `engines` label.
    pub fn engines(&self) -> Vec<String> {
        self.labels
            .get(ENGINES_LABEL)
            .map(|v| {
                v.split(',')
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_engine(&self, engine: &str) -> bool {
        self.engines().iter().any(|e| e == engine)
    }
}

/// Registration payload (`POST /nodes/register`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// Reporting hostname; the idempotency key for re-registration.
    pub address: String,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cpu_threads: u32,
    #[serde(default)]
    pub cpu_model: String,
    #[serde(default)]
    pub has_gpu: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub gpu_capabilities: Vec<String>,
    #[serde(default)]
    pub ram_total_bytes: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodeRegistration {
    pub fn into_capabilities(self) -> (String, NodeType, Option<String>, NodeCapabilities) {
        (
            self.address,
            self.node_type,
            self.name,
            NodeCapabilities {
                cpu_threads: self.cpu_threads,
                cpu_model: self.cpu_model,
                ram_total_bytes: self.ram_total_bytes,
                has_gpu: self.has_gpu,
                gpu_type: self.gpu_type,
                gpu_capabilities: self.gpu_capabilities,
                labels: self.labels,
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub address: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(flatten)]
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    /// At most one job; empty when idle.
    #[serde(default)]
    pub current_job_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    pub fn from_registration(reg: NodeRegistration) -> Self {
        let now = Utc::now();
        let (address, node_type, name, capabilities) = reg.into_capabilities();
        let name = name.unwrap_or_else(|| address.clone());
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            address,
            name,
            node_type,
            capabilities,
            status: NodeStatus::Available,
            current_job_id: String::new(),
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// Apply a re-registration in place: capabilities replace the stored
    /// ones, the node becomes available again and any stale job claim is
    /// dropped (the orphan sweep re-queues the job itself).
    pub fn apply_reregistration(&mut self, reg: NodeRegistration) {
        let (address, node_type, name, capabilities) = reg.into_capabilities();
        debug_assert_eq!(address, self.address);
        if let Some(name) = name {
            self.name = name;
        }
        self.node_type = node_type;
        self.capabilities = capabilities;
        self.status = NodeStatus::Available;
        self.current_job_id.clear();
        self.last_heartbeat = Utc::now();
    }
}
