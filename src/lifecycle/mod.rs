//! Test context lifecycle
//!
//! An [`Orchestrator`] owns one test context and walks it through
//! `Uninitialized → CertsBootstrapped → ConfigSynced → VmRunning`, one step
//! at a time. Teardown is reachable from any state and never stops at the
//! first failure: every cleanup step runs and the outcome of each is
//! collected in a [`TeardownReport`].

use anyhow::Result as AnyResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

mod render;
mod state;

pub use render::{render_device_config, FORCE_API_V1_FILE, HOSTS_FILE, SERVER_FILE};
pub use state::ContextState;

use crate::certs::{
    self, CertBundle, CertError, CertIssuer, CertLayout, WifiCredentials, ONBOARD_CERT_FILE,
};
use crate::config::{expand_path, ControllerConfig, TestbedConfig};
use crate::hypervisor::{DriverError, HypervisorDriver};
use crate::models::{CanonicalStatus, DeviceIdentity, VmInstance, VmSpec};
use crate::sync::{CloseOutcome, ConfigError, ConfigSource, SyncEngine, SyncError};
use crate::utils::{Stopwatch, Timer};

/// Lifecycle state of a test context
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    CertsBootstrapped,
    ConfigSynced,
    VmRunning,
    TornDown,
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::CertsBootstrapped => "certs_bootstrapped",
            LifecycleState::ConfigSynced => "config_synced",
            LifecycleState::VmRunning => "vm_running",
            LifecycleState::TornDown => "torn_down",
        }
    }

    /// State a forward transition into `self` must start from
    fn predecessor(&self) -> Option<LifecycleState> {
        match self {
            LifecycleState::CertsBootstrapped => Some(LifecycleState::Uninitialized),
            LifecycleState::ConfigSynced => Some(LifecycleState::CertsBootstrapped),
            LifecycleState::VmRunning => Some(LifecycleState::ConfigSynced),
            LifecycleState::Uninitialized | LifecycleState::TornDown => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lifecycle errors
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error(transparent)]
    Certs(#[from] CertError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Source(#[from] ConfigError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("instance {name} still {last} after {attempts} status checks")]
    StopTimeout {
        name: String,
        attempts: u32,
        last: CanonicalStatus,
    },

    #[error("invalid state file {}: {message}", .path.display())]
    StateFile { path: PathBuf, message: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of one teardown step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownStep {
    pub name: &'static str,
    pub error: Option<String>,
}

/// Aggregated teardown outcome
#[derive(Clone, Debug, Default)]
pub struct TeardownReport {
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    fn record<E: fmt::Display>(&mut self, name: &'static str, result: Result<(), E>) {
        let error = match result {
            Ok(()) => {
                debug!("Teardown step {} done", name);
                None
            }
            Err(e) => {
                warn!("Teardown step {} failed: {}", name, e);
                Some(e.to_string())
            }
        };
        self.steps.push(TeardownStep { name, error });
    }

    /// True when every step succeeded
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TeardownStep> {
        self.steps.iter().filter(|s| s.error.is_some())
    }

    pub fn step(&self, name: &str) -> Option<&TeardownStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed: Vec<String> = self
            .failures()
            .map(|s| format!("{} ({})", s.name, s.error.as_deref().unwrap_or_default()))
            .collect();
        if failed.is_empty() {
            write!(f, "teardown finished: {} steps ok", self.steps.len())
        } else {
            write!(
                f,
                "teardown finished with {} of {} steps failed: {}",
                failed.len(),
                self.steps.len(),
                failed.join("; ")
            )
        }
    }
}

/// Everything one context needs, resolved from configuration
#[derive(Clone, Debug)]
pub struct ContextSettings {
    pub vm: VmSpec,
    pub certs: CertLayout,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub controller: ControllerConfig,
    pub poll_interval: Duration,
    pub stop_attempts: u32,
}

impl ContextSettings {
    pub fn from_config(config: &TestbedConfig) -> AnyResult<Self> {
        Ok(Self {
            vm: config.eve.vm_spec()?,
            certs: CertLayout {
                global_dir: expand_path(&config.paths.global_certs_dir),
                certs_dir: expand_path(&config.paths.certs_dir),
                controller_domain: config.controller.domain.clone(),
                controller_ip: config.controller.ip.clone(),
                device_ip: config.device.ip.clone(),
                wifi: WifiCredentials::from_parts(
                    config.device.wifi_ssid.as_deref(),
                    config.device.wifi_password.as_deref(),
                ),
            },
            config_dir: expand_path(&config.paths.config_dir),
            state_dir: expand_path(&config.paths.state_dir),
            controller: config.controller.clone(),
            poll_interval: Duration::from_millis(config.teardown.poll_interval_ms),
            stop_attempts: config.teardown.attempts,
        })
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<(), LifecycleError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LifecycleError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove_file_if_exists(path: &Path) -> Result<(), LifecycleError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LifecycleError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Drives one test context
pub struct Orchestrator {
    settings: ContextSettings,
    driver: Arc<dyn HypervisorDriver>,
    engine: SyncEngine,
    issuer: Arc<dyn CertIssuer>,
    instance: VmInstance,
    context: ContextState,
}

impl Orchestrator {
    pub fn new(
        settings: ContextSettings,
        identity: DeviceIdentity,
        driver: Arc<dyn HypervisorDriver>,
        source: Arc<dyn ConfigSource>,
        issuer: Arc<dyn CertIssuer>,
    ) -> Self {
        let context = ContextState::new(identity, settings.vm.name.as_str(), settings.vm.backend);
        let instance = VmInstance::new(settings.vm.clone());
        Self {
            settings,
            driver,
            engine: SyncEngine::new(source),
            issuer,
            instance,
            context,
        }
    }

    /// Continue an earlier context under the same identity
    ///
    /// The state machine starts over; steps that already happened are
    /// idempotent (certificates are reused, unchanged config is not
    /// committed, a running VM is left alone).
    pub fn resume(
        settings: ContextSettings,
        previous: ContextState,
        driver: Arc<dyn HypervisorDriver>,
        source: Arc<dyn ConfigSource>,
        issuer: Arc<dyn CertIssuer>,
    ) -> Self {
        let created_at = previous.created_at;
        let mut orchestrator = Self::new(settings, previous.identity, driver, source, issuer);
        orchestrator.context.created_at = created_at;
        orchestrator
    }

    pub fn state(&self) -> LifecycleState {
        self.context.state
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.context.identity
    }

    pub fn instance(&self) -> &VmInstance {
        &self.instance
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    fn check_transition(&self, to: LifecycleState) -> Result<(), LifecycleError> {
        let from = self.state();
        if to.predecessor() == Some(from) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition { from, to })
        }
    }

    fn advance(&mut self, to: LifecycleState) -> Result<(), LifecycleError> {
        self.context.state = to;
        self.context.updated_at = Utc::now();
        self.context.save(&self.settings.state_dir)?;
        info!("Context {} is now {}", self.context.instance, to);
        Ok(())
    }

    /// Issue or reuse the CA, server and onboarding certificates
    pub async fn bootstrap_certs(&mut self) -> Result<CertBundle, LifecycleError> {
        self.check_transition(LifecycleState::CertsBootstrapped)?;
        let bundle = certs::bootstrap(
            self.issuer.as_ref(),
            &self.settings.certs,
            &self.context.identity,
        )?;
        self.advance(LifecycleState::CertsBootstrapped)?;
        Ok(bundle)
    }

    /// Render the device config directory and sync the config document
    pub async fn sync_config(&mut self) -> Result<CloseOutcome, LifecycleError> {
        self.check_transition(LifecycleState::ConfigSynced)?;
        let identity = self.context.identity.clone();
        let controller = self.settings.controller.clone();

        let config_dir = &self.settings.config_dir;
        render_device_config(config_dir, &controller).map_err(|source| LifecycleError::Io {
            path: config_dir.clone(),
            source,
        })?;

        let onboard_path = self.settings.certs.certs_dir.join(ONBOARD_CERT_FILE);
        let onboard_pem =
            std::fs::read_to_string(&onboard_path).map_err(|source| LifecycleError::Io {
                path: onboard_path.clone(),
                source,
            })?;
        self.engine.source().register(&identity, &onboard_pem).await?;

        let mut session = self.engine.open_or_default(&identity).await?;
        let document = session.document_mut();
        document.set(
            "device",
            json!({
                "id": identity.device_id.to_string(),
                "onboard_id": identity.onboard_id.to_string(),
                "model": identity.model,
            }),
        );
        document.set(
            "controller",
            json!({
                "domain": controller.domain,
                "ip": controller.ip,
                "port": controller.port,
            }),
        );
        document.set("api_v1", controller.api_v1);

        let outcome = self.engine.close(session).await?;
        self.advance(LifecycleState::ConfigSynced)?;
        Ok(outcome)
    }

    /// Start the VM from the instance spec
    pub async fn start_vm(&mut self) -> Result<(), LifecycleError> {
        self.check_transition(LifecycleState::VmRunning)?;
        self.driver.start(&self.instance.spec).await?;

        let status = self.driver.status(self.instance.name()).await?;
        self.instance.observe(status);
        if status != CanonicalStatus::Running {
            warn!(
                "{} reports {} right after start",
                self.instance.name(),
                status
            );
        }
        self.advance(LifecycleState::VmRunning)
    }

    /// Run every forward transition in order
    pub async fn bring_up(&mut self) -> Result<(), LifecycleError> {
        let mut stopwatch = Stopwatch::new();
        self.bootstrap_certs().await?;
        stopwatch.lap("certs");
        self.sync_config().await?;
        stopwatch.lap("sync");
        self.start_vm().await?;
        stopwatch.lap("start");
        info!(
            "Context {} up in {:.1}s",
            self.instance.name(),
            stopwatch.total().as_secs_f64()
        );
        debug!("Bring-up timing: {}", stopwatch.summary());
        Ok(())
    }

    /// Query the backend and fold the result into the instance status
    pub async fn refresh_status(&mut self) -> Result<CanonicalStatus, LifecycleError> {
        let status = self.driver.status(self.instance.name()).await?;
        self.instance.observe(status);
        Ok(status)
    }

    /// Stop the VM and poll until the backend reports it down
    async fn stop_and_confirm(&self) -> Result<(), LifecycleError> {
        let name = self.instance.name();
        self.driver.stop(name).await?;

        let attempts = self.settings.stop_attempts;
        let mut last = CanonicalStatus::Unknown;
        for attempt in 1..=attempts {
            match self.driver.status(name).await {
                Ok(CanonicalStatus::Stopped | CanonicalStatus::Absent) => {
                    debug!("{} down after {} status checks", name, attempt);
                    return Ok(());
                }
                Ok(status) => last = status,
                Err(e) => debug!("Status check {} for {} failed: {}", attempt, name, e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }

        Err(LifecycleError::StopTimeout {
            name: name.to_string(),
            attempts,
            last,
        })
    }

    /// Tear the context down, running every step regardless of failures
    pub async fn teardown(&mut self) -> TeardownReport {
        let timer = Timer::start(format!("teardown {}", self.instance.name()));
        let name = self.instance.name().to_string();
        let identity = self.context.identity.clone();
        info!("Tearing down context {} ({})", name, identity);

        let mut report = TeardownReport::default();
        report.record("stop", self.stop_and_confirm().await);
        let deleted = self.driver.delete(&name).await;
        let vm_gone = deleted.is_ok();
        report.record("delete", deleted);
        report.record("unregister", self.engine.source().unregister(&identity).await);
        report.record("certs", remove_dir_if_exists(&self.settings.certs.certs_dir));
        report.record("config", remove_dir_if_exists(&self.settings.config_dir));
        report.record(
            "state",
            remove_file_if_exists(&ContextState::path(&self.settings.state_dir, &identity)),
        );

        if vm_gone {
            self.instance.observe(CanonicalStatus::Absent);
        }
        self.context.state = LifecycleState::TornDown;
        self.context.updated_at = Utc::now();

        info!("{}: {}", name, report);
        timer.stop();
        report
    }
}
