//! Device config directory
//!
//! Seed files the device reads at first boot. Existing files are left
//! alone so manual edits survive a re-run.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::ControllerConfig;

pub const HOSTS_FILE: &str = "hosts";
pub const SERVER_FILE: &str = "server";
pub const FORCE_API_V1_FILE: &str = "Force-API-V1";

/// Create `path` with `content` unless it already exists
fn write_if_absent(path: &Path, content: &str) -> io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(content.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Render the device config directory, returning the files written
pub fn render_device_config(dir: &Path, controller: &ControllerConfig) -> io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;

    let mut files = vec![
        (
            HOSTS_FILE,
            format!("{} {}\n", controller.ip, controller.domain),
        ),
        (SERVER_FILE, format!("{}\n", controller.server_address())),
    ];
    if controller.api_v1 {
        files.push((FORCE_API_V1_FILE, String::new()));
    }

    let mut written = Vec::new();
    for (name, content) in files {
        let path = dir.join(name);
        if write_if_absent(&path, &content)? {
            debug!("Wrote {}", path.display());
            written.push(path);
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_render_writes_missing_files_only() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let controller = ControllerConfig::default();

        let written = render_device_config(&config_dir, &controller).unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(
            std::fs::read_to_string(config_dir.join(HOSTS_FILE)).unwrap(),
            "192.168.0.1 mydomain.adam\n"
        );
        assert_eq!(
            std::fs::read_to_string(config_dir.join(SERVER_FILE)).unwrap(),
            "mydomain.adam:3333\n"
        );

        std::fs::write(config_dir.join(SERVER_FILE), "custom:1\n").unwrap();
        let written = render_device_config(&config_dir, &controller).unwrap();
        assert!(written.is_empty());
        assert_eq!(
            std::fs::read_to_string(config_dir.join(SERVER_FILE)).unwrap(),
            "custom:1\n"
        );
    }

    #[test]
    fn test_api_v1_marker_is_optional() {
        let dir = tempdir().unwrap();
        let controller = ControllerConfig {
            api_v1: false,
            ..Default::default()
        };

        render_device_config(dir.path(), &controller).unwrap();
        assert!(!dir.path().join(FORCE_API_V1_FILE).exists());
    }
}
