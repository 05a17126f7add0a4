//! Configuration source capability

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use super::ConfigDocument;
use crate::models::DeviceIdentity;

/// Configuration source errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config document not found: {0}")]
    NotFound(String),

    #[error("temporary config source failure: {0}")]
    Retryable(String),

    #[error("config source rejected request: {0}")]
    Permanent(String),

    #[error("failed to parse config document {location}: {message}")]
    Parse { location: String, message: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Whether the same request may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConfigError::Retryable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::NotFound(_))
    }
}

/// Kind of configuration source
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    File,
    Controller,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Controller => "controller",
        }
    }

    pub fn from_str(s: &str) -> Option<SourceKind> {
        match s.trim().to_lowercase().as_str() {
            "file" => Some(SourceKind::File),
            "controller" | "adam" => Some(SourceKind::Controller),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where a device's configuration document lives
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Read the current document for a device
    async fn fetch(&self, identity: &DeviceIdentity) -> Result<ConfigDocument, ConfigError>;

    /// Persist a document for a device
    async fn commit(
        &self,
        identity: &DeviceIdentity,
        document: &ConfigDocument,
    ) -> Result<(), ConfigError>;

    /// Enroll a device with its onboarding certificate
    async fn register(
        &self,
        _identity: &DeviceIdentity,
        _onboard_cert_pem: &str,
    ) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Forget a device and its onboarding record
    async fn unregister(&self, _identity: &DeviceIdentity) -> Result<(), ConfigError> {
        Ok(())
    }
}
