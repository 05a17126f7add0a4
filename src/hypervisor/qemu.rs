//! QEMU backend
//!
//! QEMU has no VM registry: an instance is a detached process tracked by a
//! pid file. Forwarding rules are part of the launch arguments, so a stopped
//! instance is reconciled by rewriting them before relaunch. The rules of
//! the last launch are kept in a sidecar file next to the pid file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::reconcile;
use super::runner::CommandRunner;
use super::{DriverError, HypervisorDriver};
use crate::models::{BackendKind, CanonicalStatus, PortForwardSet, VmSpec};

/// QEMU launch options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuOptions {
    /// Guest architecture (`x86_64`/`amd64`, `aarch64`/`arm64`); host when unset
    pub arch: Option<String>,

    /// Host OS (`linux`, `macos`/`darwin`); detected when unset
    pub os: Option<String>,

    /// Use hardware acceleration (KVM or HVF)
    pub accel: bool,

    /// Telnet port of the serial console
    pub telnet_port: u16,

    /// SMBIOS serial number presented to the guest
    pub smbios_serial: Option<String>,

    /// Extra QEMU config passed with `-readconfig`
    pub config_file: Option<PathBuf>,

    /// Directory holding pid, log and forwarding files
    pub run_dir: PathBuf,

    /// User-mode network subnets, one NIC each; the first carries forwards
    pub subnets: Vec<String>,
}

impl Default for QemuOptions {
    fn default() -> Self {
        Self {
            arch: None,
            os: None,
            accel: true,
            telnet_port: 7777,
            smbios_serial: None,
            config_file: None,
            run_dir: PathBuf::from("dist/run"),
            subnets: vec!["10.1.0.0/24".to_string(), "10.2.0.0/24".to_string()],
        }
    }
}

/// Resolved emulator binary and acceleration flags
#[derive(Clone, Debug, PartialEq, Eq)]
struct Target {
    binary: &'static str,
    machine_args: &'static [&'static str],
}

fn normalize_os(os: &str) -> String {
    match os.to_lowercase().as_str() {
        "darwin" => "macos".to_string(),
        other => other.to_string(),
    }
}

fn normalize_arch(arch: &str) -> String {
    match arch.to_lowercase().as_str() {
        "amd64" => "x86_64".to_string(),
        "arm64" => "aarch64".to_string(),
        other => other.to_string(),
    }
}

fn resolve_target(options: &QemuOptions) -> Result<Target, DriverError> {
    let os = normalize_os(options.os.as_deref().unwrap_or(std::env::consts::OS));
    let arch = normalize_arch(options.arch.as_deref().unwrap_or(std::env::consts::ARCH));

    let machine_args: &'static [&'static str] = match (arch.as_str(), os.as_str(), options.accel) {
        ("x86_64", "linux", true) => &[
            "-machine",
            "q35,accel=kvm,dump-guest-core=off,kernel-irqchip=split",
            "-cpu",
            "host,invtsc=on,kvmclock=off",
            "-device",
            "intel-iommu,intremap=on,caching-mode=on,aw-bits=48",
        ],
        ("x86_64", "macos", true) => &["-machine", "q35,accel=hvf", "-cpu", "kvm64,kvmclock=off"],
        ("x86_64", "linux" | "macos", false) => &["-machine", "q35", "-cpu", "SandyBridge"],
        ("aarch64", "linux", true) => &[
            "-machine",
            "virt,accel=kvm,usb=off,dump-guest-core=off",
            "-cpu",
            "host",
        ],
        ("aarch64", "macos", true) => &["-machine", "virt,accel=hvf", "-cpu", "host"],
        ("aarch64", "linux" | "macos", false) => &["-machine", "virt", "-cpu", "cortex-a57"],
        _ => {
            return Err(DriverError::UnsupportedPlatform {
                os: os.clone(),
                arch: arch.clone(),
            })
        }
    };

    let binary = if arch == "x86_64" {
        "qemu-system-x86_64"
    } else {
        "qemu-system-aarch64"
    };

    Ok(Target {
        binary,
        machine_args,
    })
}

/// First DHCP lease of a user-mode subnet (`x.y.z.10`)
fn dhcp_start(subnet: &str) -> Result<Ipv4Addr, DriverError> {
    let addr = subnet.split_once('/').map(|(a, _)| a).unwrap_or(subnet);
    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| DriverError::InvalidSpec(format!("invalid subnet: {subnet}")))?;
    let [a, b, c, _] = ip.octets();
    Ok(Ipv4Addr::new(a, b, c, 10))
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DriverError + '_ {
    move |source| DriverError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// QEMU driver
pub struct QemuDriver {
    options: QemuOptions,
    runner: Arc<dyn CommandRunner>,
}

impl QemuDriver {
    pub fn new(options: QemuOptions, runner: Arc<dyn CommandRunner>) -> Self {
        Self { options, runner }
    }

    /// Pid file used as the instance handle
    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.options.run_dir.join(format!("{name}.pid"))
    }

    fn log_file(&self, name: &str) -> PathBuf {
        self.options.run_dir.join(format!("{name}.log"))
    }

    fn console_log(&self, name: &str) -> PathBuf {
        self.options.run_dir.join(format!("{name}-console.log"))
    }

    fn forwards_file(&self, name: &str) -> PathBuf {
        self.options.run_dir.join(format!("{name}.forwards.json"))
    }

    fn build_args(
        &self,
        spec: &VmSpec,
        forwards: &PortForwardSet,
        target: &Target,
    ) -> Result<Vec<String>, DriverError> {
        let mut args: Vec<String> = ["-display", "none", "-nodefaults", "-no-user-config"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        args.push("-serial".to_string());
        args.push("chardev:char0".to_string());
        args.push("-chardev".to_string());
        args.push(format!(
            "socket,id=char0,port={},host=localhost,server,nodelay,nowait,telnet,logfile={}",
            self.options.telnet_port,
            self.console_log(&spec.name).display()
        ));

        if let Some(serial) = &self.options.smbios_serial {
            args.push("-smbios".to_string());
            args.push(format!("type=1,serial={serial}"));
        }

        for (idx, subnet) in self.options.subnets.iter().enumerate() {
            let mut netdev = format!(
                "user,id=eth{idx},net={subnet},dhcpstart={}",
                dhcp_start(subnet)?
            );
            if idx == 0 {
                for rule in forwards {
                    netdev.push_str(&format!(
                        ",hostfwd={}::{}-:{}",
                        rule.protocol, rule.host_port, rule.guest_port
                    ));
                }
            }
            args.push("-netdev".to_string());
            args.push(netdev);
            args.push("-device".to_string());
            args.push(format!("virtio-net-pci,netdev=eth{idx}"));
        }

        args.extend(target.machine_args.iter().map(|s| s.to_string()));
        args.push("-smp".to_string());
        args.push(spec.resources.cpus.to_string());
        args.push("-m".to_string());
        args.push(spec.resources.memory_mb.to_string());
        args.push("-drive".to_string());
        args.push(format!(
            "file={},format=qcow2",
            spec.resources.disk_image.display()
        ));

        if let Some(config) = &self.options.config_file {
            args.push("-readconfig".to_string());
            args.push(config.display().to_string());
        }

        Ok(args)
    }

    async fn read_pid(&self, name: &str) -> Result<Option<String>, DriverError> {
        let path = self.pid_file(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    /// Status plus the pid of the running process, if any
    async fn inspect(&self, name: &str) -> Result<(CanonicalStatus, Option<u32>), DriverError> {
        let Some(content) = self.read_pid(name).await? else {
            return Ok((CanonicalStatus::Absent, None));
        };
        let Ok(pid) = content.trim().parse::<u32>() else {
            debug!("Unreadable pid file for {}: {:?}", name, content);
            return Ok((CanonicalStatus::Unknown, None));
        };

        let pid_arg = pid.to_string();
        let alive = self.runner.run("kill", &["-0", &pid_arg]).await?;
        if alive.success() {
            Ok((CanonicalStatus::Running, Some(pid)))
        } else {
            Ok((CanonicalStatus::Stopped, None))
        }
    }

    async fn recorded_forwards(&self, name: &str) -> Result<PortForwardSet, DriverError> {
        let path = self.forwards_file(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| DriverError::Io {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, e),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PortForwardSet::new()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    async fn launch(
        &self,
        spec: &VmSpec,
        forwards: &PortForwardSet,
        target: &Target,
    ) -> Result<(), DriverError> {
        let run_dir = &self.options.run_dir;
        tokio::fs::create_dir_all(run_dir)
            .await
            .map_err(io_error(run_dir))?;

        let args = self.build_args(spec, forwards, target)?;
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        info!("Starting QEMU VM {}: {} {}", spec.name, target.binary, args.join(" "));

        let pid = self
            .runner
            .spawn_detached(target.binary, &argv, &self.log_file(&spec.name))
            .await?;
        info!("QEMU VM {} running with pid {}", spec.name, pid);

        let pid_file = self.pid_file(&spec.name);
        tokio::fs::write(&pid_file, pid.to_string())
            .await
            .map_err(io_error(&pid_file))?;

        let forwards_file = self.forwards_file(&spec.name);
        let encoded = serde_json::to_vec_pretty(forwards)
            .map_err(|e| io_error(&forwards_file)(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        tokio::fs::write(&forwards_file, encoded)
            .await
            .map_err(io_error(&forwards_file))
    }

    async fn remove_file(path: &Path) -> Result<(), DriverError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path)(e)),
        }
    }
}

#[async_trait]
impl HypervisorDriver for QemuDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Qemu
    }

    async fn start(&self, spec: &VmSpec) -> Result<(), DriverError> {
        let target = resolve_target(&self.options)?;
        let name = spec.name.as_str();

        match self.inspect(name).await?.0 {
            CanonicalStatus::Running => {
                debug!("QEMU VM {} already running", name);
                Ok(())
            }
            CanonicalStatus::Absent => self.launch(spec, &spec.network.forwards, &target).await,
            CanonicalStatus::Stopped => {
                let current = self.recorded_forwards(name).await?;
                let ops = reconcile::plan(&current, &spec.network.forwards);
                for op in &ops {
                    debug!("QEMU {}: {}", name, op);
                }
                let rewritten = reconcile::apply(&current, &ops);
                self.launch(spec, &rewritten, &target).await
            }
            CanonicalStatus::Unknown => {
                Err(DriverError::unexpected_status(name, CanonicalStatus::Unknown))
            }
        }
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        if let (CanonicalStatus::Running, Some(pid)) = self.inspect(name).await? {
            info!("Stopping QEMU VM {} (pid {})", name, pid);
            let pid_arg = pid.to_string();
            self.runner.run_checked("kill", &[&pid_arg]).await?;
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<CanonicalStatus, DriverError> {
        Ok(self.inspect(name).await?.0)
    }

    async fn delete(&self, name: &str) -> Result<(), DriverError> {
        match self.inspect(name).await? {
            (CanonicalStatus::Absent, _) => {
                debug!("QEMU VM {} already absent", name);
                return Ok(());
            }
            (CanonicalStatus::Running, Some(pid)) => {
                let pid_arg = pid.to_string();
                self.runner.run_checked("kill", &[&pid_arg]).await?;
            }
            _ => {}
        }
        info!("Deleting QEMU VM {}", name);
        Self::remove_file(&self.pid_file(name)).await?;
        Self::remove_file(&self.forwards_file(name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{CommandOutput, ScriptedRunner};
    use crate::models::PortForwardRule;
    use tempfile::tempdir;

    fn options(run_dir: &Path) -> QemuOptions {
        QemuOptions {
            arch: Some("amd64".to_string()),
            os: Some("linux".to_string()),
            accel: false,
            smbios_serial: Some("31415926".to_string()),
            run_dir: run_dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn spec() -> VmSpec {
        VmSpec::new("eve-test", BackendKind::Qemu)
            .disk_image("/images/live.qcow2")
            .forwards([PortForwardRule::tcp(2222, 22)].into_iter().collect())
    }

    #[test]
    fn test_resolve_target() {
        let mut opts = QemuOptions {
            arch: Some("arm64".to_string()),
            os: Some("Darwin".to_string()),
            ..Default::default()
        };
        let target = resolve_target(&opts).unwrap();
        assert_eq!(target.binary, "qemu-system-aarch64");
        assert!(target.machine_args.contains(&"virt,accel=hvf"));

        opts.os = Some("windows".to_string());
        assert!(matches!(
            resolve_target(&opts),
            Err(DriverError::UnsupportedPlatform { .. })
        ));

        opts.os = Some("linux".to_string());
        opts.arch = Some("riscv64".to_string());
        assert!(resolve_target(&opts).is_err());
    }

    #[test]
    fn test_build_args() {
        let dir = tempdir().unwrap();
        let driver = QemuDriver::new(options(dir.path()), Arc::new(ScriptedRunner::new()));
        let spec = spec();
        let target = resolve_target(&driver.options).unwrap();

        let args = driver
            .build_args(&spec, &spec.network.forwards, &target)
            .unwrap();
        let line = args.join(" ");

        assert!(line.contains("-smbios type=1,serial=31415926"));
        assert!(line.contains(
            "-netdev user,id=eth0,net=10.1.0.0/24,dhcpstart=10.1.0.10,hostfwd=tcp::2222-:22"
        ));
        assert!(line.contains("-netdev user,id=eth1,net=10.2.0.0/24,dhcpstart=10.2.0.10 "));
        assert!(line.contains("-cpu SandyBridge"));
        assert!(line.ends_with("-drive file=/images/live.qcow2,format=qcow2"));
    }

    #[test]
    fn test_dhcp_start_rejects_garbage() {
        assert_eq!(dhcp_start("192.168.7.0/24").unwrap(), Ipv4Addr::new(192, 168, 7, 10));
        assert!(matches!(
            dhcp_start("not-a-subnet"),
            Err(DriverError::InvalidSpec(_))
        ));
    }

    #[tokio::test]
    async fn test_start_unsupported_platform_is_fatal() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let mut opts = options(dir.path());
        opts.os = Some("windows".to_string());

        let err = QemuDriver::new(opts, runner.clone())
            .start(&spec())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_absent_launches_and_records_pid() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let driver = QemuDriver::new(options(dir.path()), runner.clone());

        driver.start(&spec()).await.unwrap();

        let pid = std::fs::read_to_string(driver.pid_file("eve-test")).unwrap();
        assert_eq!(pid, "4242");
        let spawned = runner.calls_matching("spawn qemu-system-x86_64");
        assert_eq!(spawned.len(), 1);

        // process is alive now: a second start must not spawn again
        runner.respond("kill -0 4242", CommandOutput::ok(""));
        assert_eq!(driver.status("eve-test").await.unwrap(), CanonicalStatus::Running);
        driver.start(&spec()).await.unwrap();
        assert_eq!(runner.calls_matching("spawn").len(), 1);
    }

    #[tokio::test]
    async fn test_start_stopped_rewrites_forwards() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("kill -0", CommandOutput::failed(1, "No such process"));
        let driver = QemuDriver::new(options(dir.path()), runner.clone());

        let stale: PortForwardSet = [PortForwardRule::tcp(3333, 22), PortForwardRule::tcp(2222, 80)]
            .into_iter()
            .collect();
        std::fs::write(driver.pid_file("eve-test"), "999").unwrap();
        std::fs::write(
            driver.forwards_file("eve-test"),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        assert_eq!(driver.status("eve-test").await.unwrap(), CanonicalStatus::Stopped);
        driver.start(&spec()).await.unwrap();

        let spawned = runner.calls_matching("spawn").join("\n");
        assert!(spawned.contains("hostfwd=tcp::2222-:22"));
        assert!(!spawned.contains("3333"));

        let recorded = driver.recorded_forwards("eve-test").await.unwrap();
        assert!(recorded.same_rules(&spec().network.forwards));
    }

    #[tokio::test]
    async fn test_delete_absent_and_stopped() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("kill -0", CommandOutput::failed(1, "No such process"));
        let driver = QemuDriver::new(options(dir.path()), runner.clone());

        driver.delete("ghost").await.unwrap();

        std::fs::write(driver.pid_file("eve-test"), "999").unwrap();
        driver.delete("eve-test").await.unwrap();
        assert!(!driver.pid_file("eve-test").exists());
        assert_eq!(driver.status("eve-test").await.unwrap(), CanonicalStatus::Absent);
    }

    #[tokio::test]
    async fn test_stop_kills_running_process() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("kill -0", CommandOutput::ok(""));
        let driver = QemuDriver::new(options(dir.path()), runner.clone());
        std::fs::write(driver.pid_file("eve-test"), "1234\n").unwrap();

        driver.stop("eve-test").await.unwrap();
        assert_eq!(runner.calls().last().map(String::as_str), Some("kill 1234"));
        assert!(driver.pid_file("eve-test").exists());
    }
}
