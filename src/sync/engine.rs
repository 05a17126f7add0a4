//! Read-modify-write sessions over a configuration source
//!
//! A session captures the content hash of the document when it is opened.
//! Closing it compares hashes: unchanged content is never written back and
//! keeps its version, changed content gets exactly one version bump before
//! the commit.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::source::{ConfigError, ConfigSource};
use super::ConfigDocument;
use crate::models::DeviceIdentity;

/// Sync engine errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("config source error: {0}")]
    Source(#[from] ConfigError),

    #[error("failed to commit config version {version}: {source}")]
    CommitFailed {
        version: u64,
        #[source]
        source: ConfigError,
    },

    #[error("failed to serialize config document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// An open read-modify-write session
///
/// Consumed by [`SyncEngine::close`]; after a failed commit the caller has
/// to open a fresh session.
#[derive(Debug)]
pub struct SyncSession {
    identity: DeviceIdentity,
    document: ConfigDocument,
    baseline: String,
}

impl SyncSession {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut ConfigDocument {
        &mut self.document
    }

    /// Content hash captured at open time
    pub fn baseline(&self) -> &str {
        &self.baseline
    }
}

/// Result of closing a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    Unchanged { version: u64 },
    Committed { version: u64, hash: String },
}

impl CloseOutcome {
    pub fn version(&self) -> u64 {
        match self {
            CloseOutcome::Unchanged { version } | CloseOutcome::Committed { version, .. } => {
                *version
            }
        }
    }

    pub fn committed(&self) -> bool {
        matches!(self, CloseOutcome::Committed { .. })
    }
}

/// Change-detecting wrapper around a [`ConfigSource`]
#[derive(Clone)]
pub struct SyncEngine {
    source: Arc<dyn ConfigSource>,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn ConfigSource> {
        &self.source
    }

    fn session(identity: &DeviceIdentity, document: ConfigDocument) -> Result<SyncSession, SyncError> {
        let baseline = document.content_hash()?;
        debug!(
            "Opened config session for {} at v{} ({})",
            identity.device_id, document.version, baseline
        );
        Ok(SyncSession {
            identity: identity.clone(),
            document,
            baseline,
        })
    }

    /// Fetch the current document and start a session over it
    pub async fn open(&self, identity: &DeviceIdentity) -> Result<SyncSession, SyncError> {
        let document = self.source.fetch(identity).await?;
        Self::session(identity, document)
    }

    /// Like [`open`](Self::open), starting from an empty version 0 document
    /// when the source has none yet
    pub async fn open_or_default(&self, identity: &DeviceIdentity) -> Result<SyncSession, SyncError> {
        match self.source.fetch(identity).await {
            Ok(document) => Self::session(identity, document),
            Err(e) if e.is_not_found() => {
                debug!("No config document for {} yet", identity.device_id);
                Self::session(identity, ConfigDocument::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Finish a session, committing only if its content changed
    pub async fn close(&self, session: SyncSession) -> Result<CloseOutcome, SyncError> {
        let SyncSession {
            identity,
            mut document,
            baseline,
        } = session;

        if document.content_hash()? == baseline {
            debug!("Config for {} unchanged at v{}", identity.device_id, document.version);
            return Ok(CloseOutcome::Unchanged {
                version: document.version,
            });
        }

        document.version += 1;
        let hash = document.content_hash()?;
        self.source
            .commit(&identity, &document)
            .await
            .map_err(|source| SyncError::CommitFailed {
                version: document.version,
                source,
            })?;

        info!(
            "Committed config v{} for {} via {} source",
            document.version,
            identity.device_id,
            self.source.kind()
        );
        Ok(CloseOutcome::Committed {
            version: document.version,
            hash,
        })
    }
}
