//! Device access material kept next to the onboarding certificate
//!
//! The SSH pair lets tests log into the device. The port override brings up
//! wireless management when Wi-Fi credentials are configured.

use serde::{Deserialize, Serialize};
use serde_json::json;
use ssh_key::{rand_core::OsRng, Algorithm, LineEnding, PrivateKey, PublicKey};
use std::path::Path;
use tracing::{debug, warn};

use super::CertError;

pub const SSH_KEY_FILE: &str = "id_ed25519";
pub const SSH_PUBLIC_KEY_FILE: &str = "id_ed25519.pub";
pub const PORT_CONFIG_DIR: &str = "DevicePortConfig";
pub const PORT_OVERRIDE_FILE: &str = "override.json";

/// Device SSH key pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshPair {
    /// Public key in `authorized_keys` format
    pub public_openssh: String,
    pub reused: bool,
}

/// Wireless network the device joins
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    /// Credentials when both parts are set and non-empty
    pub fn from_parts(ssid: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (ssid, password) {
            (Some(ssid), Some(password)) if !ssid.is_empty() && !password.is_empty() => {
                Some(Self {
                    ssid: ssid.to_string(),
                    password: password.to_string(),
                })
            }
            _ => None,
        }
    }
}

fn read_ssh_pair(key_path: &Path, public_path: &Path) -> Option<SshPair> {
    let private = PrivateKey::read_openssh_file(key_path).ok()?;
    let public = PublicKey::read_openssh_file(public_path).ok()?;
    if private.public_key().key_data() != public.key_data() {
        return None;
    }
    Some(SshPair {
        public_openssh: public.to_openssh().ok()?,
        reused: true,
    })
}

/// Keep a matching key pair on disk or write a fresh Ed25519 one
pub fn ensure_ssh_pair(key_path: &Path, public_path: &Path) -> Result<SshPair, CertError> {
    if let Some(pair) = read_ssh_pair(key_path, public_path) {
        debug!("Reusing SSH key {}", key_path.display());
        return Ok(pair);
    }
    if key_path.exists() || public_path.exists() {
        warn!("SSH key pair at {} is unusable, regenerating", key_path.display());
    }

    let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    private.write_openssh_file(key_path, LineEnding::LF)?;
    let public = private.public_key();
    public.write_openssh_file(public_path)?;

    Ok(SshPair {
        public_openssh: public.to_openssh()?,
        reused: false,
    })
}

/// Port configuration with wired and wireless management ports
fn port_override(wifi: &WifiCredentials) -> serde_json::Value {
    json!({
        "Version": 1,
        "Key": "override",
        "TimePriority": "2000-01-01T00:00:00Z",
        "Ports": [
            {
                "IfName": "eth0",
                "Name": "Management",
                "IsMgmt": true,
                "Dhcp": 4
            },
            {
                "IfName": "wlan0",
                "Name": "Wireless",
                "IsMgmt": true,
                "Dhcp": 4,
                "WirelessCfg": {
                    "WType": 2,
                    "Wifi": [{
                        "SSID": wifi.ssid,
                        "KeyScheme": 1,
                        "Password": wifi.password,
                        "Priority": 10
                    }]
                }
            }
        ]
    })
}

/// Write `DevicePortConfig/override.json` unless one is already there.
/// Returns whether the file was written.
pub fn seed_port_override(certs_dir: &Path, wifi: &WifiCredentials) -> Result<bool, CertError> {
    let dir = certs_dir.join(PORT_CONFIG_DIR);
    let path = dir.join(PORT_OVERRIDE_FILE);
    if path.exists() {
        debug!("Keeping port override {}", path.display());
        return Ok(false);
    }

    let content = serde_json::to_string_pretty(&port_override(wifi))?;
    std::fs::create_dir_all(&dir).map_err(|source| CertError::Io {
        path: dir.clone(),
        source,
    })?;
    std::fs::write(&path, content).map_err(|source| CertError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(true)
}
