//! Hardware capability detection for registration. One sweep at agent
//! startup: CPU shape via sysinfo, GPU and encoder tags via NVML, engine
//! binaries via PATH probing, battery presence from sysfs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use nvml_wrapper::Nvml;
use once_cell::sync::OnceCell;
use sysinfo::System;
use tracing::debug;

use crate::domain::node::{ENGINES_LABEL, NodeRegistration, NodeType};

/// GPU surface as far as dispatch cares: presence, a display name, and
/// the encoder tags jobs can require.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuInfo {
    pub present: bool,
    pub name: Option<String>,
    pub encoder_tags: Vec<String>,
}

/// Detect everything and assemble the registration payload.
pub fn detect_registration(address: String, name: Option<String>) -> NodeRegistration {
    let sys = System::new_all();

    let cpu_threads = sys.cpus().len() as u32;
    let cpu_model = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .unwrap_or_default();
    let ram_total_bytes = sys.total_memory();

    let gpu = detect_gpu();
    let engines = detect_engines();
    let battery = has_battery();

    let node_type = classify(cpu_threads, ram_total_bytes, battery);

    let mut labels = BTreeMap::new();
    if !engines.is_empty() {
        labels.insert(ENGINES_LABEL.to_string(), engines.join(","));
    }
    if battery {
        labels.insert("battery".to_string(), "present".to_string());
    }

    debug!(
        cpu_threads,
        cpu_model = %cpu_model,
        gpu = ?gpu.name,
        engines = ?engines,
        node_type = %node_type.as_str(),
        "hardware detected"
    );

    NodeRegistration {
        address,
        node_type,
        name,
        cpu_threads,
        cpu_model,
        has_gpu: gpu.present,
        gpu_type: gpu.name,
        gpu_capabilities: gpu.encoder_tags,
        ram_total_bytes,
        labels,
    }
}

/// Node classification: laptops throttle and roam, servers are the
/// workhorses, everything else is a desktop.
pub fn classify(cpu_threads: u32, ram_total_bytes: u64, battery: bool) -> NodeType {
    if battery {
        return NodeType::Laptop;
    }
    if cpu_threads >= 16 && ram_total_bytes >= 32 << 30 {
        return NodeType::Server;
    }
    NodeType::Desktop
}

/// NVML init is expensive and not idempotent across failures; share one
/// instance for the process like the usage monitor does.
fn nvml() -> Option<&'static Mutex<Nvml>> {
    static NVML: OnceCell<Option<Mutex<Nvml>>> = OnceCell::new();
    NVML.get_or_init(|| Nvml::init().ok().map(Mutex::new)).as_ref()
}

pub fn detect_gpu() -> GpuInfo {
    let Some(nvml) = nvml() else {
        return GpuInfo::default();
    };
    let nvml = nvml.lock().unwrap_or_else(|e| e.into_inner());
    let count = nvml.device_count().unwrap_or(0);
    if count == 0 {
        return GpuInfo::default();
    }
    let Ok(device) = nvml.device_by_index(0) else {
        return GpuInfo::default();
    };
    let name = device.name().ok();
    GpuInfo {
        present: true,
        encoder_tags: encoder_tags_for(name.as_deref().unwrap_or_default()),
        name,
    }
}

/// Encoder tags by GPU generation. Every NVENC-capable card does H.264
/// and everything Pascal-or-later does HEVC; AV1 encode arrived with Ada.
pub fn encoder_tags_for(gpu_name: &str) -> Vec<String> {
    let mut tags = vec!["nvenc_h264".to_string(), "nvenc_hevc".to_string()];
    let name = gpu_name.to_ascii_lowercase();
    let ada_or_later = ["rtx 40", "rtx 50", "ada", "l4", "l40"]
        .iter()
        .any(|m| name.contains(m));
    if ada_or_later {
        tags.push("nvenc_av1".to_string());
    }
    tags
}

/// Transcoding engines present on this machine, by PATH probe.
pub fn detect_engines() -> Vec<String> {
    let mut engines = Vec::new();
    if binary_on_path("ffmpeg") {
        engines.push("ffmpeg".to_string());
    }
    if binary_on_path("gst-launch-1.0") {
        engines.push("gstreamer".to_string());
    }
    engines
}

pub fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(name)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Battery presence from the power-supply class; absent on servers and
/// inside containers, which is the right default.
pub fn has_battery() -> bool {
    let Ok(entries) = std::fs::read_dir("/sys/class/power_supply") else {
        return false;
    };
    entries
        .flatten()
        .any(|e| e.file_name().to_string_lossy().starts_with("BAT"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_the_tiers() {
        assert_eq!(classify(8, 16 << 30, true), NodeType::Laptop);
        assert_eq!(classify(32, 64 << 30, true), NodeType::Laptop);
        assert_eq!(classify(32, 64 << 30, false), NodeType::Server);
        assert_eq!(classify(16, 32 << 30, false), NodeType::Server);
        assert_eq!(classify(8, 16 << 30, false), NodeType::Desktop);
        assert_eq!(classify(32, 16 << 30, false), NodeType::Desktop);
    }

    #[test]
    fn encoder_tags_track_gpu_generation() {
        let pascal = encoder_tags_for("NVIDIA GeForce GTX 1080");
        assert!(pascal.contains(&"nvenc_h264".to_string()));
        assert!(pascal.contains(&"nvenc_hevc".to_string()));
        assert!(!pascal.contains(&"nvenc_av1".to_string()));

        let ada = encoder_tags_for("NVIDIA GeForce RTX 4090");
        assert!(ada.contains(&"nvenc_av1".to_string()));
    }

    #[test]
    fn registration_carries_detected_labels() {
        let reg = detect_registration("host-under-test".into(), Some("t".into()));
        assert_eq!(reg.address, "host-under-test");
        assert!(reg.cpu_threads > 0, "at least one CPU must be visible");
        if let Some(engines) = reg.labels.get(ENGINES_LABEL) {
            assert!(!engines.is_empty());
        }
    }
}
