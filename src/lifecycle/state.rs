//! Persisted context state
//!
//! One `state-<onboard-id>.yml` per test context so a later command can
//! find the identity a VM was brought up with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{LifecycleError, LifecycleState};
use crate::models::{BackendKind, DeviceIdentity};

/// Snapshot of a test context
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextState {
    pub state: LifecycleState,
    pub identity: DeviceIdentity,
    pub instance: String,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextState {
    pub fn new(identity: DeviceIdentity, instance: impl Into<String>, backend: BackendKind) -> Self {
        let now = Utc::now();
        Self {
            state: LifecycleState::Uninitialized,
            identity,
            instance: instance.into(),
            backend,
            created_at: now,
            updated_at: now,
        }
    }

    /// State file of a context
    pub fn path(state_dir: &Path, identity: &DeviceIdentity) -> PathBuf {
        state_dir.join(format!("state-{}.yml", identity.onboard_id))
    }

    pub fn save(&self, state_dir: &Path) -> Result<PathBuf, LifecycleError> {
        let path = Self::path(state_dir, &self.identity);
        fs::create_dir_all(state_dir).map_err(|source| LifecycleError::Io {
            path: state_dir.to_path_buf(),
            source,
        })?;
        let content = serde_yaml::to_string(self).map_err(|e| LifecycleError::StateFile {
            path: path.clone(),
            message: e.to_string(),
        })?;
        fs::write(&path, content).map_err(|source| LifecycleError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("Saved context state {} to {}", self.state, path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, LifecycleError> {
        let content = fs::read_to_string(path).map_err(|source| LifecycleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| LifecycleError::StateFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Most recently updated context for an instance name
    ///
    /// Unreadable state files are skipped.
    pub fn find(state_dir: &Path, instance: &str) -> Result<Option<Self>, LifecycleError> {
        if !state_dir.exists() {
            return Ok(None);
        }
        let entries = fs::read_dir(state_dir).map_err(|source| LifecycleError::Io {
            path: state_dir.to_path_buf(),
            source,
        })?;

        let mut found: Option<Self> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_state_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("state-") && n.ends_with(".yml"))
                .unwrap_or(false);
            if !is_state_file {
                continue;
            }
            match Self::load(&path) {
                Ok(state) if state.instance == instance => {
                    if found.as_ref().map_or(true, |f| state.updated_at > f.updated_at) {
                        found = Some(state);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Skipping state file: {}", e),
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_load_find() {
        let dir = tempdir().unwrap();
        let identity = DeviceIdentity::generate("ZedVirtual-4G");
        let mut state = ContextState::new(identity.clone(), "eve-a", BackendKind::Qemu);
        state.state = LifecycleState::ConfigSynced;

        let path = state.save(dir.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("state-{}.yml", identity.onboard_id)
        );

        let loaded = ContextState::load(&path).unwrap();
        assert_eq!(loaded.identity, identity);
        assert_eq!(loaded.state, LifecycleState::ConfigSynced);

        ContextState::new(DeviceIdentity::generate("ZedVirtual-4G"), "eve-b", BackendKind::Parallels)
            .save(dir.path())
            .unwrap();
        std::fs::write(dir.path().join("state-broken.yml"), ": : :").unwrap();

        let found = ContextState::find(dir.path(), "eve-a").unwrap().unwrap();
        assert_eq!(found.identity, identity);
        assert!(ContextState::find(dir.path(), "eve-c").unwrap().is_none());
        assert!(ContextState::find(&dir.path().join("missing"), "eve-a")
            .unwrap()
            .is_none());
    }
}
