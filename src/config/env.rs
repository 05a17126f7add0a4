//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;

use super::TestbedConfig;
use crate::models::BackendKind;
use crate::sync::SourceKind;

/// Environment variable prefix
const ENV_PREFIX: &str = "EDGE_TESTBED";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Config file from EDGE_TESTBED_CONFIG
    pub config_file: Option<String>,
    /// Backend from EDGE_TESTBED_BACKEND
    pub backend: Option<String>,
    /// VM name from EDGE_TESTBED_VM_NAME
    pub vm_name: Option<String>,
    /// CPU count from EDGE_TESTBED_CPUS
    pub cpus: Option<u32>,
    /// Memory from EDGE_TESTBED_MEMORY
    pub memory_mb: Option<u32>,
    /// Disk image from EDGE_TESTBED_IMAGE
    pub image: Option<String>,
    /// Controller domain from EDGE_TESTBED_CONTROLLER_DOMAIN
    pub controller_domain: Option<String>,
    /// Controller IP from EDGE_TESTBED_CONTROLLER_IP
    pub controller_ip: Option<String>,
    /// Controller port from EDGE_TESTBED_CONTROLLER_PORT
    pub controller_port: Option<u16>,
    /// Device IP from EDGE_TESTBED_DEVICE_IP
    pub device_ip: Option<String>,
    /// Wi-Fi network from EDGE_TESTBED_WIFI_SSID
    pub wifi_ssid: Option<String>,
    /// Wi-Fi password from EDGE_TESTBED_WIFI_PASSWORD
    pub wifi_password: Option<String>,
    /// Sync source from EDGE_TESTBED_SYNC_SOURCE
    pub sync_source: Option<String>,
    /// Hardware acceleration from EDGE_TESTBED_ACCEL
    pub accel: Option<bool>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            config_file: get_env("CONFIG"),
            backend: get_env("BACKEND"),
            vm_name: get_env("VM_NAME"),
            cpus: get_env_parse("CPUS"),
            memory_mb: get_env_parse("MEMORY"),
            image: get_env("IMAGE"),
            controller_domain: get_env("CONTROLLER_DOMAIN"),
            controller_ip: get_env("CONTROLLER_IP"),
            controller_port: get_env_parse("CONTROLLER_PORT"),
            device_ip: get_env("DEVICE_IP"),
            wifi_ssid: get_env("WIFI_SSID"),
            wifi_password: get_env("WIFI_PASSWORD"),
            sync_source: get_env("SYNC_SOURCE"),
            accel: get_env_bool("ACCEL"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.config_file.is_some()
            || self.backend.is_some()
            || self.vm_name.is_some()
            || self.cpus.is_some()
            || self.memory_mb.is_some()
            || self.image.is_some()
            || self.controller_domain.is_some()
            || self.controller_ip.is_some()
            || self.controller_port.is_some()
            || self.device_ip.is_some()
            || self.wifi_ssid.is_some()
            || self.wifi_password.is_some()
            || self.sync_source.is_some()
            || self.accel.is_some()
    }

    /// Override file settings with the values set here
    pub fn apply(&self, config: &mut TestbedConfig) -> Result<()> {
        if let Some(backend) = &self.backend {
            match BackendKind::from_str(backend) {
                Some(kind) => config.eve.backend = kind,
                None => bail!("Unknown backend in {ENV_PREFIX}_BACKEND: {backend}"),
            }
        }
        if let Some(source) = &self.sync_source {
            match SourceKind::from_str(source) {
                Some(kind) => config.sync.source = kind,
                None => bail!("Unknown sync source in {ENV_PREFIX}_SYNC_SOURCE: {source}"),
            }
        }
        if let Some(name) = &self.vm_name {
            config.eve.name = name.clone();
        }
        if let Some(cpus) = self.cpus {
            config.eve.cpus = cpus;
        }
        if let Some(memory) = self.memory_mb {
            config.eve.memory_mb = memory;
        }
        if let Some(image) = &self.image {
            config.eve.image = PathBuf::from(image);
        }
        if let Some(accel) = self.accel {
            config.eve.qemu.accel = accel;
        }
        if let Some(domain) = &self.controller_domain {
            config.controller.domain = domain.clone();
        }
        if let Some(ip) = &self.controller_ip {
            config.controller.ip = ip.clone();
        }
        if let Some(port) = self.controller_port {
            config.controller.port = port;
        }
        if let Some(ip) = &self.device_ip {
            config.device.ip = ip.clone();
        }
        if let Some(ssid) = &self.wifi_ssid {
            config.device.wifi_ssid = Some(ssid.clone());
        }
        if let Some(password) = &self.wifi_password {
            config.device.wifi_password = Some(password.clone());
        }
        Ok(())
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_CONFIG:            {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_BACKEND:           {:?}", ENV_PREFIX, self.backend);
        println!("  {}_VM_NAME:           {:?}", ENV_PREFIX, self.vm_name);
        println!("  {}_CPUS:              {:?}", ENV_PREFIX, self.cpus);
        println!("  {}_MEMORY:            {:?}", ENV_PREFIX, self.memory_mb);
        println!("  {}_IMAGE:             {:?}", ENV_PREFIX, self.image);
        println!("  {}_CONTROLLER_DOMAIN: {:?}", ENV_PREFIX, self.controller_domain);
        println!("  {}_CONTROLLER_IP:     {:?}", ENV_PREFIX, self.controller_ip);
        println!("  {}_CONTROLLER_PORT:   {:?}", ENV_PREFIX, self.controller_port);
        println!("  {}_DEVICE_IP:         {:?}", ENV_PREFIX, self.device_ip);
        println!("  {}_WIFI_SSID:         {:?}", ENV_PREFIX, self.wifi_ssid);
        println!(
            "  {}_WIFI_PASSWORD:     {}",
            ENV_PREFIX,
            if self.wifi_password.is_some() { "<set>" } else { "None" }
        );
        println!("  {}_SYNC_SOURCE:       {:?}", ENV_PREFIX, self.sync_source);
        println!("  {}_ACCEL:             {:?}", ENV_PREFIX, self.accel);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Restores environment variables on drop
    struct EnvGuard {
        previous: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn set(vars: &[(&str, &str)]) -> Self {
            let previous = vars
                .iter()
                .map(|(k, v)| {
                    let key = format!("{ENV_PREFIX}_{k}");
                    let old = env::var(&key).ok();
                    env::set_var(&key, v);
                    (key, old)
                })
                .collect();
            Self { previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.previous {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.backend.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_env_load_and_apply() {
        let _guard = EnvGuard::set(&[
            ("VM_NAME", "eve-ci"),
            ("CONTROLLER_PORT", "4444"),
            ("ACCEL", "off"),
        ]);

        let env = EnvConfig::load();
        assert_eq!(env.vm_name.as_deref(), Some("eve-ci"));
        assert_eq!(env.controller_port, Some(4444));
        assert_eq!(env.accel, Some(false));

        let mut config = TestbedConfig::default();
        env.apply(&mut config).unwrap();
        assert_eq!(config.eve.name, "eve-ci");
        assert_eq!(config.controller.port, 4444);
        assert!(!config.eve.qemu.accel);
    }

    #[test]
    fn test_apply_rejects_unknown_backend() {
        let env = EnvConfig {
            backend: Some("hyperv".to_string()),
            ..Default::default()
        };
        assert!(env.apply(&mut TestbedConfig::default()).is_err());

        let env = EnvConfig {
            backend: Some("vbox".to_string()),
            sync_source: Some("controller".to_string()),
            ..Default::default()
        };
        let mut config = TestbedConfig::default();
        env.apply(&mut config).unwrap();
        assert_eq!(config.eve.backend, BackendKind::VirtualBox);
        assert_eq!(config.sync.source, SourceKind::Controller);
    }
}
