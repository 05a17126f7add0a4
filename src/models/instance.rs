//! Virtual machine instance models
//!
//! Backend-agnostic description of the device VM and its observed status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::forward::PortForwardSet;

/// Supported hypervisor backends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Qemu,
    VirtualBox,
    Parallels,
}

impl BackendKind {
    /// Get backend display name
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Qemu => "QEMU",
            BackendKind::VirtualBox => "VirtualBox",
            BackendKind::Parallels => "Parallels",
        }
    }

    /// Get all backends
    pub fn all() -> Vec<BackendKind> {
        vec![
            BackendKind::Qemu,
            BackendKind::VirtualBox,
            BackendKind::Parallels,
        ]
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<BackendKind> {
        match s.to_lowercase().as_str() {
            "qemu" | "kvm" => Some(BackendKind::Qemu),
            "virtualbox" | "vbox" => Some(BackendKind::VirtualBox),
            "parallels" | "prl" => Some(BackendKind::Parallels),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Compute resources of the VM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpus: u32,
    /// Memory in MiB
    pub memory_mb: u32,
    /// Disk image (qcow2 for QEMU, vdi/vmdk for VirtualBox, hdd bundle for Parallels)
    pub disk_image: PathBuf,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpus: 4,
            memory_mb: 4096,
            disk_image: PathBuf::from("dist/live.qcow2"),
        }
    }
}

/// Network configuration of the VM
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub forwards: PortForwardSet,
}

/// Full description of the VM a driver should bring up
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub backend: BackendKind,
    pub resources: ResourceSpec,
    pub network: NetworkSpec,
}

impl VmSpec {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend,
            resources: ResourceSpec::default(),
            network: NetworkSpec::default(),
        }
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.resources.cpus = cpus;
        self
    }

    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.resources.memory_mb = memory_mb;
        self
    }

    pub fn disk_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.resources.disk_image = path.into();
        self
    }

    pub fn forwards(mut self, forwards: PortForwardSet) -> Self {
        self.network.forwards = forwards;
        self
    }
}

/// Backend-agnostic status reported by a driver
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalStatus {
    Absent,
    Stopped,
    Running,
    /// Output could not be interpreted; never treated as absent
    Unknown,
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CanonicalStatus::Absent => "absent",
            CanonicalStatus::Stopped => "stopped",
            CanonicalStatus::Running => "running",
            CanonicalStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of the instance as tracked by the orchestrator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Absent,
    /// Exists on the backend but has not been seen running in this context
    Created,
    Running,
    Stopped,
}

/// VM instance owned by one test context
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmInstance {
    pub spec: VmSpec,
    pub status: InstanceStatus,
}

impl VmInstance {
    pub fn new(spec: VmSpec) -> Self {
        Self {
            spec,
            status: InstanceStatus::Absent,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Fold a driver observation into the tracked status
    ///
    /// `Unknown` observations leave the status untouched.
    pub fn observe(&mut self, status: CanonicalStatus) {
        self.status = match (status, self.status) {
            (CanonicalStatus::Absent, _) => InstanceStatus::Absent,
            (CanonicalStatus::Running, _) => InstanceStatus::Running,
            (CanonicalStatus::Stopped, InstanceStatus::Running | InstanceStatus::Stopped) => {
                InstanceStatus::Stopped
            }
            (CanonicalStatus::Stopped, _) => InstanceStatus::Created,
            (CanonicalStatus::Unknown, current) => current,
        };
    }
}
