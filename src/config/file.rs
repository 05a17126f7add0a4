//! Configuration file management
//!
//! Handles finding, loading, and validating configuration files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{
    expand_path, ControllerConfig, DeviceConfig, EnvConfig, EveConfig, PathsConfig, SyncConfig,
    TeardownConfig,
};
use crate::models::BackendKind;
use crate::sync::SourceKind;

/// Configuration file locations (in order of precedence)
const CONFIG_LOCATIONS: &[&str] = &[
    "./edge-testbed.yaml",
    "./edge-testbed.yml",
    "./.edge-testbed.yaml",
    "./.edge-testbed/config.yaml",
    "~/.config/edge-testbed/config.yaml",
    "~/.edge-testbed.yaml",
];

/// Full configuration file structure
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestbedConfig {
    /// Version of config file format
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub eve: EveConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub teardown: TeardownConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            eve: EveConfig::default(),
            controller: ControllerConfig::default(),
            device: DeviceConfig::default(),
            paths: PathsConfig::default(),
            sync: SyncConfig::default(),
            teardown: TeardownConfig::default(),
        }
    }
}

impl TestbedConfig {
    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(*location))
            .find(|path| path.exists())
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        if let Some(path) = Self::find() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from an explicit path, the standard locations, then apply
    /// environment overrides
    pub fn resolve(path: Option<&Path>, env: &EnvConfig) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env.config_file.as_ref().map(PathBuf::from));
        let mut config = match explicit {
            Some(path) => Self::load(&path)?,
            None => Self::load_default()?,
        };
        env.apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !["1.0"].contains(&self.version.as_str()) {
            anyhow::bail!("Unsupported config version: {}", self.version);
        }

        if self.eve.name.trim().is_empty() {
            anyhow::bail!("eve.name must not be empty");
        }
        if self.eve.cpus == 0 {
            anyhow::bail!("eve.cpus must be at least 1");
        }
        if self.eve.memory_mb < 512 {
            anyhow::bail!(
                "eve.memory_mb must be at least 512, got {}",
                self.eve.memory_mb
            );
        }
        self.eve.forward_set()?;

        if self.eve.backend == BackendKind::Qemu && self.eve.qemu.subnets.is_empty() {
            anyhow::bail!("eve.qemu.subnets needs at least one subnet");
        }

        if self.controller.port == 0 {
            anyhow::bail!("controller.port must not be 0");
        }
        if self.sync.source == SourceKind::File && self.sync.file.as_os_str().is_empty() {
            anyhow::bail!("sync.file is required for the file source");
        }
        if self.teardown.attempts == 0 {
            anyhow::bail!("teardown.attempts must be at least 1");
        }

        Ok(())
    }

    /// Generate example configuration
    pub fn example() -> Self {
        let mut config = Self::default();
        config.eve.backend = BackendKind::Qemu;
        config.eve.qemu.smbios_serial = Some(config.device.serial.clone());
        config
    }
}

/// Check if file is YAML based on extension
fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
