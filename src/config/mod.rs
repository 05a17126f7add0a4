//! Configuration module
//!
//! Settings of one test context, loaded from a YAML or JSON file and
//! overridden from the environment.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub mod env;
pub mod file;

pub use env::EnvConfig;
pub use file::TestbedConfig;

use crate::hypervisor::QemuOptions;
use crate::models::{BackendKind, PortForwardSet, VmSpec, DEFAULT_DEVICE_MODEL};
use crate::sync::SourceKind;

/// Expand ~ to home directory
pub fn expand_path(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path
}

/// The VM running the device under test
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EveConfig {
    /// VM name, also the backend handle
    pub name: String,

    /// Hypervisor backend
    pub backend: BackendKind,

    pub cpus: u32,

    /// Memory in MiB
    pub memory_mb: u32,

    /// Disk image
    pub image: PathBuf,

    /// Forwarded ports, `host port -> guest port`
    pub forwards: BTreeMap<String, String>,

    /// QEMU specific options
    pub qemu: QemuOptions,
}

impl Default for EveConfig {
    fn default() -> Self {
        let mut forwards = BTreeMap::new();
        forwards.insert("2222".to_string(), "22".to_string());
        forwards.insert("5912".to_string(), "5901".to_string());

        Self {
            name: "eve-testbed".to_string(),
            backend: BackendKind::default(),
            cpus: 4,
            memory_mb: 4096,
            image: PathBuf::from("dist/live.qcow2"),
            forwards,
            qemu: QemuOptions::default(),
        }
    }
}

impl EveConfig {
    /// Desired forwarding rules
    pub fn forward_set(&self) -> Result<PortForwardSet> {
        let (set, invalid) = PortForwardSet::from_port_map(&self.forwards);
        if !invalid.is_empty() {
            bail!("Invalid port forwards: {}", invalid.join(", "));
        }
        Ok(set)
    }

    /// Instance spec handed to the hypervisor driver
    pub fn vm_spec(&self) -> Result<VmSpec> {
        Ok(VmSpec::new(self.name.as_str(), self.backend)
            .cpus(self.cpus)
            .memory_mb(self.memory_mb)
            .disk_image(expand_path(&self.image))
            .forwards(self.forward_set()?))
    }
}

/// Management controller endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub domain: String,
    pub ip: String,
    pub port: u16,

    /// Explicit URL; derived from domain and port when unset
    pub url: Option<String>,

    /// Force the device onto the v1 API
    pub api_v1: bool,

    /// HTTP timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            domain: "mydomain.adam".to_string(),
            ip: "192.168.0.1".to_string(),
            port: 3333,
            url: None,
            api_v1: true,
            timeout_secs: 30,
        }
    }
}

impl ControllerConfig {
    pub fn url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("https://{}:{}", self.domain, self.port))
    }

    /// `domain:port` as written into the device config
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.domain, self.port)
    }
}

/// The device as seen by the controller
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device model descriptor
    pub model: String,

    /// Address the device is reached at
    pub ip: String,

    /// Serial number used when onboarding
    pub serial: String,

    /// Wireless network for the management port; both parts must be set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_ssid: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_password: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_DEVICE_MODEL.to_string(),
            ip: "192.168.0.2".to_string(),
            serial: "31415926".to_string(),
            wifi_ssid: None,
            wifi_password: None,
        }
    }
}

/// Directories of a test context
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Per-context certificates
    pub certs_dir: PathBuf,

    /// Certificates shared across contexts (CA, controller server cert)
    pub global_certs_dir: PathBuf,

    /// Rendered device config directory
    pub config_dir: PathBuf,

    /// Context state files
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            certs_dir: PathBuf::from("dist/certs"),
            global_certs_dir: PathBuf::from("~/.edge-testbed/certs"),
            config_dir: PathBuf::from("dist/config"),
            state_dir: PathBuf::from("dist/state"),
        }
    }
}

/// Where the device config document is synced to
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub source: SourceKind,

    /// Document path for the file source
    pub file: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::File,
            file: PathBuf::from("dist/config/device.json"),
        }
    }
}

/// Shutdown confirmation during teardown
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// Delay between status polls in milliseconds
    pub poll_interval_ms: u64,

    /// Status polls before giving up on a clean stop
    pub attempts: u32,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PortForwardRule;

    #[test]
    fn test_default_vm_spec() {
        let spec = EveConfig::default().vm_spec().unwrap();
        assert_eq!(spec.name, "eve-testbed");
        assert_eq!(spec.backend, BackendKind::Qemu);
        assert!(spec.network.forwards.contains(&PortForwardRule::tcp(2222, 22)));
        assert_eq!(spec.network.forwards.len(), 2);
    }

    #[test]
    fn test_invalid_forward_rejected() {
        let mut eve = EveConfig::default();
        eve.forwards.insert("ssh".to_string(), "22".to_string());
        let err = eve.vm_spec().unwrap_err();
        assert!(err.to_string().contains("ssh:22"));
    }

    #[test]
    fn test_controller_url() {
        let mut controller = ControllerConfig::default();
        assert_eq!(controller.url(), "https://mydomain.adam:3333");
        assert_eq!(controller.server_address(), "mydomain.adam:3333");

        controller.url = Some("http://127.0.0.1:8080".to_string());
        assert_eq!(controller.url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("dist/certs"), PathBuf::from("dist/certs"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/.edge-testbed"), home.join(".edge-testbed"));
        }
    }
}
