//! File-backed configuration source
//!
//! One document at a fixed path, JSON or YAML by extension.

use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use super::source::{ConfigError, ConfigSource, SourceKind};
use super::ConfigDocument;
use crate::models::DeviceIdentity;

/// Check if path is a YAML file
fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}

/// Document stored in a local file
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, content: &str) -> Result<ConfigDocument, ConfigError> {
        let parse_error = |message: String| ConfigError::Parse {
            location: self.path.display().to_string(),
            message,
        };
        if is_yaml_file(&self.path) {
            serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string()))
        } else {
            serde_json::from_str(content).map_err(|e| parse_error(e.to_string()))
        }
    }

    fn render(&self, document: &ConfigDocument) -> Result<String, ConfigError> {
        let result = if is_yaml_file(&self.path) {
            serde_yaml::to_string(document).map_err(|e| e.to_string())
        } else {
            serde_json::to_string_pretty(document).map_err(|e| e.to_string())
        };
        result.map_err(|message| ConfigError::Parse {
            location: self.path.display().to_string(),
            message,
        })
    }

    /// Write through a temporary sibling, then rename over the target
    fn write_atomic(&self, content: &str) -> Result<(), ConfigError> {
        let io_error = |source: io::Error| ConfigError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_error)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_error)?;
        tmp.write_all(content.as_bytes()).map_err(io_error)?;
        tmp.as_file().sync_all().map_err(io_error)?;
        tmp.persist(&self.path).map_err(|e| io_error(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    async fn fetch(&self, _identity: &DeviceIdentity) -> Result<ConfigDocument, ConfigError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(self.path.display().to_string()))
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        debug!("Read config document from {}", self.path.display());
        self.parse(&content)
    }

    async fn commit(
        &self,
        _identity: &DeviceIdentity,
        document: &ConfigDocument,
    ) -> Result<(), ConfigError> {
        let content = self.render(document)?;
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.write_atomic(&content))
            .await
            .map_err(|e| ConfigError::Io {
                path: self.path.clone(),
                source: io::Error::other(e),
            })??;
        debug!(
            "Wrote config document v{} to {}",
            document.version,
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::generate("ZedVirtual-4G")
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let source = FileSource::new(dir.path().join("device.json"));

        let err = source.fetch(&identity()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_commit_then_fetch_json_and_yaml() {
        let dir = tempdir().unwrap();
        for name in ["device.json", "device.yaml"] {
            let source = FileSource::new(dir.path().join("nested").join(name));
            let mut doc = ConfigDocument::new().with_version(3);
            doc.set("hosts", json!(["mydomain.adam"]));

            source.commit(&identity(), &doc).await.unwrap();
            assert_eq!(source.fetch(&identity()).await.unwrap(), doc);
        }

        let yaml = std::fs::read_to_string(dir.path().join("nested/device.yaml")).unwrap();
        assert!(yaml.contains("version: 3"));
    }

    #[tokio::test]
    async fn test_commit_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let source = FileSource::new(dir.path().join("device.json"));

        source
            .commit(&identity(), &ConfigDocument::new())
            .await
            .unwrap();
        source
            .commit(&identity(), &ConfigDocument::new().with_version(1))
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_malformed_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FileSource::new(&path).fetch(&identity()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
