//! VirtualBox backend
//!
//! Drives `VBoxManage`. Status and forwarding rules come from
//! `showvminfo --machinereadable`, whose `key="value"` lines include
//! `VMState="running"` and `Forwarding(N)="name,tcp,,2222,,22"`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::reconcile::{self, ForwardOp};
use super::runner::{command_line, CommandRunner};
use super::{DriverError, HypervisorDriver};
use crate::models::{
    BackendKind, CanonicalStatus, PortForwardRule, PortForwardSet, Protocol, VmSpec,
};

const VBOXMANAGE: &str = "VBoxManage";

/// Messages printed by VBoxManage for an unknown VM
const NOT_FOUND_MARKERS: &[&str] = &[
    "Could not find a registered machine",
    "VBOX_E_OBJECT_NOT_FOUND",
];

/// Parsed `showvminfo` output
#[derive(Clone, Debug, PartialEq, Eq)]
struct VmInfo {
    status: CanonicalStatus,
    /// Stopped with a saved machine state, which locks `modifyvm`
    saved: bool,
    /// Forwarding rules with the names VirtualBox knows them by
    forwards: Vec<(String, PortForwardRule)>,
}

impl VmInfo {
    fn active(&self) -> PortForwardSet {
        self.forwards.iter().map(|(_, rule)| *rule).collect()
    }

    fn name_of(&self, rule: &PortForwardRule) -> String {
        self.forwards
            .iter()
            .find(|(_, r)| r == rule)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| rule.rule_name())
    }
}

fn parse_state(value: &str) -> CanonicalStatus {
    match value {
        "running" => CanonicalStatus::Running,
        "poweroff" | "aborted" | "saved" => CanonicalStatus::Stopped,
        _ => CanonicalStatus::Unknown,
    }
}

/// Parse one `name,proto,hostip,hostport,guestip,guestport` rule
fn parse_forward(value: &str) -> Option<(String, PortForwardRule)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(value.as_bytes());
    let record = reader.records().next()?.ok()?;
    if record.len() < 6 {
        return None;
    }
    let protocol = Protocol::from_str(&record[1])?;
    let host_port = record[3].trim().parse().ok()?;
    let guest_port = record[5].trim().parse().ok()?;
    Some((
        record[0].to_string(),
        PortForwardRule {
            host_port,
            guest_port,
            protocol,
        },
    ))
}

fn parse_vm_info(output: &str) -> VmInfo {
    let mut status = CanonicalStatus::Unknown;
    let mut saved = false;
    let mut forwards = Vec::new();

    for line in output.lines().map(str::trim) {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        if key == "VMState" {
            status = parse_state(value);
            saved = value == "saved";
        } else if key.starts_with("Forwarding") {
            match parse_forward(value) {
                Some(forward) => forwards.push(forward),
                None => debug!("Ignoring unparsable forwarding rule: {}", value),
            }
        }
    }

    VmInfo {
        status,
        saved,
        forwards,
    }
}

/// VirtualBox driver
pub struct VirtualBoxDriver {
    runner: Arc<dyn CommandRunner>,
}

impl VirtualBoxDriver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn vboxmanage(&self, args: &[&str]) -> Result<(), DriverError> {
        self.runner.run_checked(VBOXMANAGE, args).await.map(|_| ())
    }

    /// Query the VM; `None` when VirtualBox does not know it
    async fn inspect(&self, name: &str) -> Result<Option<VmInfo>, DriverError> {
        let args = ["showvminfo", name, "--machinereadable"];
        let output = self.runner.run(VBOXMANAGE, &args).await?;

        if !output.success() {
            let text = output.combined();
            if NOT_FOUND_MARKERS.iter().any(|m| text.contains(m)) {
                return Ok(None);
            }
            return Err(DriverError::BackendCommandFailed {
                command: command_line(VBOXMANAGE, &args),
                output: text,
            });
        }

        Ok(Some(parse_vm_info(&output.stdout)))
    }

    async fn create(&self, spec: &VmSpec) -> Result<(), DriverError> {
        let name = spec.name.as_str();
        let cpus = spec.resources.cpus.to_string();
        let memory = spec.resources.memory_mb.to_string();
        let disk = spec.resources.disk_image.to_string_lossy().to_string();

        info!("Creating VirtualBox VM {}", name);
        self.vboxmanage(&["createvm", "--name", name, "--register"])
            .await?;
        self.vboxmanage(&[
            "modifyvm",
            name,
            "--cpus",
            &cpus,
            "--memory",
            &memory,
            "--vram",
            "16",
            "--nested-hw-virt",
            "on",
            "--ostype",
            "Ubuntu_64",
            "--mouse",
            "usbtablet",
            "--graphicscontroller",
            "vmsvga",
            "--boot1",
            "disk",
            "--boot2",
            "net",
        ])
        .await?;
        self.vboxmanage(&[
            "storagectl",
            name,
            "--name",
            "SATA",
            "--add",
            "sata",
            "--bootable",
            "on",
            "--hostiocache",
            "on",
        ])
        .await?;
        self.vboxmanage(&[
            "storageattach",
            name,
            "--storagectl",
            "SATA",
            "--port",
            "0",
            "--device",
            "0",
            "--type",
            "hdd",
            "--medium",
            &disk,
        ])
        .await?;
        self.vboxmanage(&["modifyvm", name, "--nic1", "nat", "--cableconnected1", "on"])
            .await
    }

    /// Apply a plan with `modifyvm`; only valid while the VM is powered off
    async fn apply_forwards(
        &self,
        name: &str,
        info: Option<&VmInfo>,
        ops: &[ForwardOp],
    ) -> Result<(), DriverError> {
        for op in ops {
            debug!("VirtualBox {}: {}", name, op);
            match op {
                ForwardOp::Remove(rule) => {
                    let rule_name = info
                        .map(|i| i.name_of(rule))
                        .unwrap_or_else(|| rule.rule_name());
                    self.vboxmanage(&["modifyvm", name, "--natpf1", "delete", &rule_name])
                        .await?;
                }
                ForwardOp::Add(rule) => {
                    let encoded = format!(
                        "{},{},,{},,{}",
                        rule.rule_name(),
                        rule.protocol,
                        rule.host_port,
                        rule.guest_port
                    );
                    self.vboxmanage(&["modifyvm", name, "--natpf1", &encoded])
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn launch(&self, name: &str) -> Result<(), DriverError> {
        info!("Starting VirtualBox VM {}", name);
        self.vboxmanage(&["startvm", name, "--type", "headless"])
            .await
    }
}

#[async_trait]
impl HypervisorDriver for VirtualBoxDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::VirtualBox
    }

    async fn start(&self, spec: &VmSpec) -> Result<(), DriverError> {
        let name = spec.name.as_str();
        let desired = &spec.network.forwards;

        match self.inspect(name).await? {
            None => {
                self.create(spec).await?;
                let ops = reconcile::plan(&PortForwardSet::new(), desired);
                self.apply_forwards(name, None, &ops).await?;
                self.launch(name).await
            }
            Some(info) => match info.status {
                CanonicalStatus::Running => {
                    debug!("VirtualBox VM {} already running", name);
                    Ok(())
                }
                CanonicalStatus::Stopped => {
                    if info.saved {
                        info!("Discarding saved state of VirtualBox VM {}", name);
                        self.vboxmanage(&["discardstate", name]).await?;
                    }
                    let ops = reconcile::plan(&info.active(), desired);
                    self.apply_forwards(name, Some(&info), &ops).await?;
                    self.launch(name).await
                }
                status => Err(DriverError::unexpected_status(name, status)),
            },
        }
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        match self.inspect(name).await? {
            None => Ok(()),
            Some(info) if info.status == CanonicalStatus::Stopped => Ok(()),
            Some(_) => {
                info!("Powering off VirtualBox VM {}", name);
                self.vboxmanage(&["controlvm", name, "poweroff"]).await
            }
        }
    }

    async fn status(&self, name: &str) -> Result<CanonicalStatus, DriverError> {
        Ok(self
            .inspect(name)
            .await?
            .map(|info| info.status)
            .unwrap_or(CanonicalStatus::Absent))
    }

    async fn delete(&self, name: &str) -> Result<(), DriverError> {
        if self.inspect(name).await?.is_none() {
            debug!("VirtualBox VM {} already absent", name);
            return Ok(());
        }
        info!("Deleting VirtualBox VM {}", name);
        self.vboxmanage(&["unregistervm", name, "--delete"]).await
    }
}
