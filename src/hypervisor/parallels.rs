//! Parallels Desktop backend
//!
//! VMs are managed with `prlctl`; port forwarding lives in the global
//! `Shared` network and is managed with `prlsrvctl`, so rules can be edited
//! whether or not the VM is running.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::reconcile::{self, ForwardOp};
use super::runner::{command_line, CommandRunner};
use super::{DriverError, HypervisorDriver};
use crate::models::{
    BackendKind, CanonicalStatus, PortForwardRule, PortForwardSet, Protocol, VmSpec,
};

const PRLCTL: &str = "prlctl";
const PRLSRVCTL: &str = "prlsrvctl";
const SHARED_NETWORK: &str = "Shared";

/// Host-only subnets of the two virtio NICs
const NIC_SUBNETS: &[&str] = &["192.168.1.0/24", "192.168.2.0/24"];

const NOT_FOUND_MARKERS: &[&str] = &["could not be found", "does not exist", "not found"];

/// Parse `prlctl status` output (`VM <name> exist <state>`)
fn parse_status(output: &str) -> CanonicalStatus {
    let mut words = output.split_whitespace().skip_while(|w| *w != "exist");
    if words.next().is_none() {
        return CanonicalStatus::Unknown;
    }
    match words.next() {
        Some("running") => CanonicalStatus::Running,
        Some("stopped" | "suspended" | "paused") => CanonicalStatus::Stopped,
        _ => CanonicalStatus::Unknown,
    }
}

/// Name of a rule in the shared network; scoped by VM so several test
/// contexts can share one host
fn rule_name(vm: &str, rule: &PortForwardRule) -> String {
    format!("{}_{}", vm, rule.rule_name())
}

/// Parse the forwarding rules of `vm` out of `prlsrvctl net info Shared`
///
/// Rules are listed under `TCP rules:` / `UDP rules:` headers, one per line
/// as `<name> <host port> <vm> <guest port>` (commas are accepted as
/// separators too). Rules of other VMs are skipped.
fn parse_net_rules(output: &str, vm: &str) -> Vec<(String, PortForwardRule)> {
    let mut rules = Vec::new();
    let mut protocol: Option<Protocol> = None;

    for line in output.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_suffix("rules:") {
            protocol = Protocol::from_str(header);
            continue;
        }
        if line.ends_with(':') {
            protocol = None;
            continue;
        }
        let Some(protocol) = protocol else {
            continue;
        };

        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        if fields.len() < 4 || fields[2] != vm {
            continue;
        }
        let (Ok(host_port), Ok(guest_port)) = (fields[1].parse(), fields[3].parse()) else {
            debug!("Ignoring unparsable Parallels rule: {}", line);
            continue;
        };
        rules.push((
            fields[0].to_string(),
            PortForwardRule {
                host_port,
                guest_port,
                protocol,
            },
        ));
    }

    rules
}

/// Parallels driver
pub struct ParallelsDriver {
    runner: Arc<dyn CommandRunner>,
}

impl ParallelsDriver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn prlctl(&self, args: &[&str]) -> Result<(), DriverError> {
        self.runner.run_checked(PRLCTL, args).await.map(|_| ())
    }

    async fn active_rules(&self, vm: &str) -> Result<Vec<(String, PortForwardRule)>, DriverError> {
        let output = self
            .runner
            .run_checked(PRLSRVCTL, &["net", "info", SHARED_NETWORK])
            .await?;
        Ok(parse_net_rules(&output.stdout, vm))
    }

    /// Move the VM's shared-network rules to `desired`
    async fn reconcile_forwards(
        &self,
        vm: &str,
        desired: &PortForwardSet,
    ) -> Result<(), DriverError> {
        let active = self.active_rules(vm).await?;
        let current: PortForwardSet = active.iter().map(|(_, rule)| *rule).collect();

        for op in reconcile::plan(&current, desired) {
            debug!("Parallels {}: {}", vm, op);
            match op {
                ForwardOp::Remove(rule) => {
                    let name = active
                        .iter()
                        .find(|(_, r)| *r == rule)
                        .map(|(name, _)| name.clone())
                        .unwrap_or_else(|| rule_name(vm, &rule));
                    let flag = format!("--nat-{}-del", rule.protocol);
                    self.runner
                        .run_checked(PRLSRVCTL, &["net", "set", SHARED_NETWORK, &flag, &name])
                        .await?;
                }
                ForwardOp::Add(rule) => {
                    let flag = format!("--nat-{}-add", rule.protocol);
                    let encoded = format!(
                        "{},{},{},{}",
                        rule_name(vm, &rule),
                        rule.host_port,
                        vm,
                        rule.guest_port
                    );
                    self.runner
                        .run_checked(PRLSRVCTL, &["net", "set", SHARED_NETWORK, &flag, &encoded])
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &VmSpec) -> Result<(), DriverError> {
        let name = spec.name.as_str();
        let cpus = spec.resources.cpus.to_string();
        let memory = spec.resources.memory_mb.to_string();
        // Parallels wants the .hdd bundle directory, not the image file
        let image = spec
            .resources
            .disk_image
            .with_extension("")
            .to_string_lossy()
            .to_string();

        info!("Creating Parallels VM {}", name);
        self.prlctl(&["create", name, "--distribution", "ubuntu", "--no-hdd"])
            .await?;
        self.prlctl(&[
            "set",
            name,
            "--device-del",
            "net0",
            "--cpus",
            &cpus,
            "--memsize",
            &memory,
            "--nested-virt",
            "on",
            "--adaptive-hypervisor",
            "on",
            "--hypervisor-type",
            "parallels",
        ])
        .await?;
        self.prlctl(&["set", name, "--device-add", "hdd", "--image", &image])
            .await?;
        for subnet in NIC_SUBNETS.iter().copied() {
            self.prlctl(&[
                "set",
                name,
                "--device-add",
                "net",
                "--type",
                "shared",
                "--adapter-type",
                "virtio",
                "--ipadd",
                subnet,
                "--dhcp",
                "yes",
            ])
            .await?;
        }
        Ok(())
    }

    async fn launch(&self, name: &str) -> Result<(), DriverError> {
        info!("Starting Parallels VM {}", name);
        self.prlctl(&["start", name]).await
    }
}

#[async_trait]
impl HypervisorDriver for ParallelsDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Parallels
    }

    async fn start(&self, spec: &VmSpec) -> Result<(), DriverError> {
        let name = spec.name.as_str();
        match self.status(name).await? {
            CanonicalStatus::Running => {
                debug!("Parallels VM {} already running", name);
                Ok(())
            }
            CanonicalStatus::Absent => {
                self.create(spec).await?;
                // Stale rules from an earlier run may still hold our host ports
                self.reconcile_forwards(name, &spec.network.forwards).await?;
                self.launch(name).await
            }
            CanonicalStatus::Stopped => {
                self.reconcile_forwards(name, &spec.network.forwards).await?;
                self.launch(name).await
            }
            CanonicalStatus::Unknown => {
                Err(DriverError::unexpected_status(name, CanonicalStatus::Unknown))
            }
        }
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        match self.status(name).await? {
            CanonicalStatus::Absent | CanonicalStatus::Stopped => Ok(()),
            _ => {
                info!("Stopping Parallels VM {}", name);
                self.prlctl(&["stop", name, "--kill"]).await
            }
        }
    }

    async fn status(&self, name: &str) -> Result<CanonicalStatus, DriverError> {
        let args = ["status", name];
        let output = self.runner.run(PRLCTL, &args).await?;
        if output.success() {
            return Ok(parse_status(&output.stdout));
        }

        let text = output.combined();
        let lowered = text.to_lowercase();
        if NOT_FOUND_MARKERS.iter().any(|m| lowered.contains(m)) {
            Ok(CanonicalStatus::Absent)
        } else {
            Err(DriverError::BackendCommandFailed {
                command: command_line(PRLCTL, &args),
                output: text,
            })
        }
    }

    async fn delete(&self, name: &str) -> Result<(), DriverError> {
        if self.status(name).await? == CanonicalStatus::Absent {
            debug!("Parallels VM {} already absent", name);
            return Ok(());
        }
        self.reconcile_forwards(name, &PortForwardSet::new()).await?;
        info!("Deleting Parallels VM {}", name);
        self.prlctl(&["delete", name]).await
    }
}
