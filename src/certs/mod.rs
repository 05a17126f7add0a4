//! Certificate bootstrap
//!
//! A test context needs three certificate pairs: a root CA shared by all
//! contexts, a controller server certificate signed by it, and the device's
//! onboarding certificate. Existing pairs that still parse are reused as-is.
//! The device SSH key pair and an optional Wi-Fi port override are written
//! alongside the onboarding pair.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

mod device;
mod issuer;

pub use device::{
    ensure_ssh_pair, seed_port_override, SshPair, WifiCredentials, PORT_CONFIG_DIR,
    PORT_OVERRIDE_FILE, SSH_KEY_FILE, SSH_PUBLIC_KEY_FILE,
};
pub use issuer::RcgenIssuer;

use crate::models::DeviceIdentity;

pub const CA_CERT_FILE: &str = "root-certificate.pem";
pub const CA_KEY_FILE: &str = "root-certificate-key.pem";
pub const SERVER_CERT_FILE: &str = "server.pem";
pub const SERVER_KEY_FILE: &str = "server-key.pem";
pub const ONBOARD_CERT_FILE: &str = "onboard.cert.pem";
pub const ONBOARD_KEY_FILE: &str = "onboard.key.pem";

/// Certificate errors
#[derive(Error, Debug)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid issuer: {0}")]
    InvalidIssuer(String),

    #[error("SSH key error: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("port override encoding failed: {0}")]
    PortConfig(#[from] serde_json::Error),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A certificate and its private key, PEM encoded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedPair {
    pub cert_pem: String,
    pub key_pem: String,
    /// True when an existing pair on disk was kept
    pub reused: bool,
}

/// What to issue when no usable pair exists
#[derive(Clone, Debug)]
pub struct CertTemplate {
    pub common_name: String,
    /// DNS names or IP addresses
    pub subject_alt_names: Vec<String>,
    pub is_ca: bool,
    /// Signing pair; self-signed when absent
    pub issuer: Option<IssuedPair>,
}

impl CertTemplate {
    /// Self-signed certificate authority
    pub fn authority(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            subject_alt_names: Vec::new(),
            is_ca: true,
            issuer: None,
        }
    }

    /// End-entity certificate
    pub fn leaf(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            subject_alt_names: Vec::new(),
            is_ca: false,
            issuer: None,
        }
    }

    pub fn subject_alt_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subject_alt_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn signed_by(mut self, issuer: IssuedPair) -> Self {
        self.issuer = Some(issuer);
        self
    }
}

/// Issues certificate pairs, keeping valid existing ones
pub trait CertIssuer: Send + Sync {
    fn issue_or_reuse(
        &self,
        cert_path: &Path,
        key_path: &Path,
        template: &CertTemplate,
    ) -> Result<IssuedPair, CertError>;
}

/// Where certificates live and what the server certificate covers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CertLayout {
    /// Shared across contexts: CA and server pairs
    pub global_dir: PathBuf,
    /// Per context: onboarding pair and a copy of the CA certificate
    pub certs_dir: PathBuf,
    pub controller_domain: String,
    pub controller_ip: String,
    pub device_ip: String,
    /// Seeds a wireless port override when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi: Option<WifiCredentials>,
}

/// Certificates of one test context
#[derive(Clone, Debug)]
pub struct CertBundle {
    pub ca: IssuedPair,
    pub server: IssuedPair,
    pub onboard: IssuedPair,
    pub ssh: SshPair,
    /// True when the port override was written by this run
    pub port_override_written: bool,
}

/// Issue or reuse the CA, server, onboarding and SSH pairs of a context
pub fn bootstrap(
    issuer: &dyn CertIssuer,
    layout: &CertLayout,
    identity: &DeviceIdentity,
) -> Result<CertBundle, CertError> {
    let global = &layout.global_dir;
    let ca = issuer.issue_or_reuse(
        &global.join(CA_CERT_FILE),
        &global.join(CA_KEY_FILE),
        &CertTemplate::authority("edge-testbed root"),
    )?;

    let server_template = CertTemplate::leaf(layout.controller_domain.as_str())
        .subject_alt_names([
            layout.controller_domain.as_str(),
            layout.controller_ip.as_str(),
            layout.device_ip.as_str(),
            "127.0.0.1",
        ])
        .signed_by(ca.clone());
    let server = issuer.issue_or_reuse(
        &global.join(SERVER_CERT_FILE),
        &global.join(SERVER_KEY_FILE),
        &server_template,
    )?;

    let certs = &layout.certs_dir;
    let ca_copy = certs.join(CA_CERT_FILE);
    std::fs::create_dir_all(certs).map_err(|source| CertError::Io {
        path: certs.clone(),
        source,
    })?;
    std::fs::write(&ca_copy, &ca.cert_pem).map_err(|source| CertError::Io {
        path: ca_copy.clone(),
        source,
    })?;

    let onboard_template =
        CertTemplate::leaf(identity.device_id.to_string()).signed_by(ca.clone());
    let onboard = issuer.issue_or_reuse(
        &certs.join(ONBOARD_CERT_FILE),
        &certs.join(ONBOARD_KEY_FILE),
        &onboard_template,
    )?;

    let ssh = ensure_ssh_pair(&certs.join(SSH_KEY_FILE), &certs.join(SSH_PUBLIC_KEY_FILE))?;
    let port_override_written = match &layout.wifi {
        Some(wifi) => seed_port_override(certs, wifi)?,
        None => false,
    };

    info!(
        "Certificates ready in {} (CA reused: {}, server reused: {}, onboard reused: {}, ssh reused: {})",
        certs.display(),
        ca.reused,
        server.reused,
        onboard.reused,
        ssh.reused
    );
    Ok(CertBundle {
        ca,
        server,
        onboard,
        ssh,
        port_override_written,
    })
}
