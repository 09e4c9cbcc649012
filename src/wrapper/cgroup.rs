//! cgroup v2 governance. The controller interface is plain files under
//! the cgroup filesystem, so this talks to it directly: create the group,
//! write the limits, move the pid in. Removal only ever touches groups we
//! created ourselves, and only after the last process left.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::wrapper::WrapperError;

/// Period for `cpu.max` quotas, in microseconds (the kernel default).
const CPU_PERIOD_USEC: u64 = 100_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CgroupLimits {
    /// Percent of one CPU (100 = one full core, 200 = two).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_max_percent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_max_bytes: Option<u64>,
    /// 1-10000, kernel default 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_weight: Option<u16>,
}

impl CgroupLimits {
    pub fn is_unlimited(&self) -> bool {
        self.cpu_max_percent.is_none()
            && self.memory_max_bytes.is_none()
            && self.io_weight.is_none()
    }
}

#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
    /// Whether we created the directory and may remove it afterwards.
    owned: bool,
}

impl Cgroup {
    /// Create (or reuse) a per-job group under `root` and apply limits.
    pub fn create(root: &Path, name: &str, limits: &CgroupLimits) -> Result<Self, WrapperError> {
        let path = root.join(name);
        fs::create_dir_all(&path)
            .map_err(|e| WrapperError::Cgroup(format!("create {}: {e}", path.display())))?;
        let group = Self { path, owned: true };
        group.apply_limits(limits)?;
        Ok(group)
    }

    /// Adopt a pre-existing group; limits stay as found and the directory
    /// is never removed.
    pub fn attach(path: impl Into<PathBuf>) -> Result<Self, WrapperError> {
        let path = path.into();
        if !path.is_dir() {
            return Err(WrapperError::Cgroup(format!(
                "no such cgroup: {}",
                path.display()
            )));
        }
        Ok(Self { path, owned: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply_limits(&self, limits: &CgroupLimits) -> Result<(), WrapperError> {
        if let Some(percent) = limits.cpu_max_percent {
            let quota = u64::from(percent) * CPU_PERIOD_USEC / 100;
            self.write_control("cpu.max", &format!("{quota} {CPU_PERIOD_USEC}"))?;
        }
        if let Some(bytes) = limits.memory_max_bytes {
            self.write_control("memory.max", &bytes.to_string())?;
        }
        if let Some(weight) = limits.io_weight {
            self.write_control("io.weight", &weight.to_string())?;
        }
        Ok(())
    }

    /// Move a process into the group.
    pub fn add_process(&self, pid: u32) -> Result<(), WrapperError> {
        self.write_control("cgroup.procs", &pid.to_string())
    }

    fn write_control(&self, file: &str, value: &str) -> Result<(), WrapperError> {
        let path = self.path.join(file);
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|mut f| f.write_all(value.as_bytes()))
            .map_err(|e| WrapperError::Cgroup(format!("write {value:?} to {}: {e}", path.display())))
    }

    /// Best-effort removal of an owned, empty group. The kernel refuses to
    /// remove a group with members, which is exactly the behavior we want:
    /// never touch a workload that is still alive.
    pub fn remove_if_owned(&self) {
        if self.owned {
            let _ = fs::remove_dir(&self.path);
        }
    }
}
