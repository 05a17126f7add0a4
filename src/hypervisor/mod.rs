//! Hypervisor backends
//!
//! One [`HypervisorDriver`] capability with independent VirtualBox, QEMU and
//! Parallels implementations. Drivers translate each backend's textual
//! command surface into [`CanonicalStatus`] and keep forwarding rules
//! reconciled through [`reconcile::plan`].

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

mod parallels;
mod qemu;
pub mod reconcile;
mod runner;
mod vbox;

pub use parallels::ParallelsDriver;
pub use qemu::{QemuDriver, QemuOptions};
pub use reconcile::ForwardOp;
pub use runner::{command_line, CommandOutput, CommandRunner, SystemRunner};
pub use vbox::VirtualBoxDriver;

#[cfg(test)]
pub(crate) use runner::scripted::ScriptedRunner;

use crate::models::{BackendKind, CanonicalStatus, VmSpec};

/// Hypervisor driver errors
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("backend command `{command}` failed: {output}")]
    BackendCommandFailed { command: String, output: String },

    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("invalid instance spec: {0}")]
    InvalidSpec(String),

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DriverError {
    /// Whether retrying the whole call could succeed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::UnsupportedPlatform { .. } | DriverError::InvalidSpec(_)
        )
    }

    pub(crate) fn unexpected_status(name: &str, status: CanonicalStatus) -> Self {
        DriverError::BackendCommandFailed {
            command: format!("status {name}"),
            output: format!("refusing to act on instance in {status} state"),
        }
    }
}

/// Lifecycle operations every backend provides
///
/// `start` is idempotent: a running instance is left untouched, a stopped
/// one has its forwarding rules reconciled before launch, and an absent one
/// is created from the full spec. `delete` on an absent instance succeeds.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn start(&self, spec: &VmSpec) -> Result<(), DriverError>;

    async fn stop(&self, name: &str) -> Result<(), DriverError>;

    async fn status(&self, name: &str) -> Result<CanonicalStatus, DriverError>;

    async fn delete(&self, name: &str) -> Result<(), DriverError>;
}

/// Build the driver for a backend
pub fn driver_for(
    backend: BackendKind,
    qemu: QemuOptions,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn HypervisorDriver> {
    match backend {
        BackendKind::Qemu => Box::new(QemuDriver::new(qemu, runner)),
        BackendKind::VirtualBox => Box::new(VirtualBoxDriver::new(runner)),
        BackendKind::Parallels => Box::new(ParallelsDriver::new(runner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_for_selects_backend() {
        let runner: Arc<dyn CommandRunner> = Arc::new(ScriptedRunner::new());
        for backend in BackendKind::all() {
            let driver = driver_for(backend, QemuOptions::default(), runner.clone());
            assert_eq!(driver.kind(), backend);
        }
    }

    #[test]
    fn test_fatal_errors() {
        let unsupported = DriverError::UnsupportedPlatform {
            os: "windows".to_string(),
            arch: "x86_64".to_string(),
        };
        assert!(unsupported.is_fatal());

        let failed = DriverError::BackendCommandFailed {
            command: "VBoxManage startvm eve".to_string(),
            output: "error".to_string(),
        };
        assert!(!failed.is_fatal());
    }
}
