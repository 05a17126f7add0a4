//! edge-testbed - bring edge device VMs up and down for testing
//!
//! ## Usage
//!
//! ```bash
//! # Write an example configuration
//! edge-testbed config init
//!
//! # Bootstrap certificates, sync config and start the VM
//! edge-testbed -c edge-testbed.yaml up
//!
//! # Show the context and VM status
//! edge-testbed status
//!
//! # Stop and delete the VM, unregister the device and clean up
//! edge-testbed down
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use edge_testbed::certs::RcgenIssuer;
use edge_testbed::config::{expand_path, EnvConfig, TestbedConfig};
use edge_testbed::hypervisor::{driver_for, CommandRunner, HypervisorDriver, SystemRunner};
use edge_testbed::lifecycle::{ContextSettings, ContextState, Orchestrator};
use edge_testbed::models::DeviceIdentity;
use edge_testbed::sync::{ConfigSource, ControllerSource, FileSource, SourceKind};
use edge_testbed::utils::{init_logger, LogLevel};

mod cli;

use cli::{Args, Command, ConfigAction};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(LogLevel::from_verbosity(args.verbose));

    match args.command {
        Command::Up => bring_up(args.config.as_deref()).await?,
        Command::Down => tear_down(args.config.as_deref()).await?,
        Command::Status => show_status(args.config.as_deref()).await?,
        Command::Config(config_args) => manage_config(args.config.as_deref(), config_args.action)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<TestbedConfig> {
    let env = EnvConfig::load();
    TestbedConfig::resolve(path, &env).context("Failed to load configuration")
}

fn build_source(config: &TestbedConfig) -> Result<Arc<dyn ConfigSource>> {
    let source: Arc<dyn ConfigSource> = match config.sync.source {
        SourceKind::File => Arc::new(FileSource::new(expand_path(&config.sync.file))),
        SourceKind::Controller => Arc::new(
            ControllerSource::new(config.controller.url(), config.controller.timeout_secs)
                .context("Failed to create controller client")?
                .serial(config.device.serial.clone()),
        ),
    };
    Ok(source)
}

fn build_driver(config: &TestbedConfig) -> Arc<dyn HypervisorDriver> {
    let mut qemu = config.eve.qemu.clone();
    qemu.run_dir = expand_path(&qemu.run_dir);
    if qemu.smbios_serial.is_none() {
        qemu.smbios_serial = Some(config.device.serial.clone());
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    Arc::from(driver_for(config.eve.backend, qemu, runner))
}

/// Resume the context recorded for the configured VM, or start a new one
fn build_orchestrator(config: &TestbedConfig) -> Result<Orchestrator> {
    let settings = ContextSettings::from_config(config)?;
    let driver = build_driver(config);
    let source = build_source(config)?;
    let issuer = Arc::new(RcgenIssuer::new());

    let previous = ContextState::find(&settings.state_dir, &settings.vm.name)
        .context("Failed to read context state")?;

    let orchestrator = match previous {
        Some(previous) => {
            info!(
                "Resuming context {} ({}) last seen {}",
                previous.instance, previous.identity, previous.updated_at
            );
            Orchestrator::resume(settings, previous, driver, source, issuer)
        }
        None => {
            let identity = DeviceIdentity::generate(config.device.model.clone());
            info!("New context {} ({})", settings.vm.name, identity);
            Orchestrator::new(settings, identity, driver, source, issuer)
        }
    };
    Ok(orchestrator)
}

async fn bring_up(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let mut orchestrator = build_orchestrator(&config)?;

    orchestrator
        .bring_up()
        .await
        .with_context(|| format!("Failed to bring up {}", orchestrator.instance().name()))?;

    let identity = orchestrator.identity();
    println!("✓ {} is running", orchestrator.instance().name());
    println!("  Backend:    {}", config.eve.backend);
    println!("  Device id:  {}", identity.device_id);
    println!("  Onboard id: {}", identity.onboard_id);
    println!("  Controller: {}", config.controller.server_address());
    for rule in orchestrator.settings().vm.network.forwards.iter() {
        println!("  Forward:    {rule}");
    }

    Ok(())
}

async fn tear_down(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let mut orchestrator = build_orchestrator(&config)?;

    let report = orchestrator.teardown().await;
    println!("{}", orchestrator.instance().name());
    for step in &report.steps {
        match &step.error {
            None => println!("  ✓ {}", step.name),
            Some(error) => println!("  ✗ {}: {}", step.name, error),
        }
    }

    if !report.is_clean() {
        anyhow::bail!("Teardown incomplete: {report}");
    }
    Ok(())
}

async fn show_status(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let settings = ContextSettings::from_config(&config)?;

    match ContextState::find(&settings.state_dir, &settings.vm.name)? {
        Some(state) => {
            println!("Context {}", state.instance);
            println!("  State:      {}", state.state);
            println!("  Backend:    {}", state.backend);
            println!("  Device id:  {}", state.identity.device_id);
            println!("  Onboard id: {}", state.identity.onboard_id);
            println!("  Created:    {}", state.created_at.to_rfc3339());
            println!("  Updated:    {}", state.updated_at.to_rfc3339());
        }
        None => println!("No context recorded for {}", settings.vm.name),
    }

    let mut orchestrator = build_orchestrator(&config)?;
    match orchestrator.refresh_status().await {
        Ok(status) => println!("  VM:         {status} ({:?})", orchestrator.instance().status),
        Err(e) => println!("  VM:         unavailable ({e})"),
    }

    Ok(())
}

fn manage_config(path: Option<&Path>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {}. Use --force to overwrite.",
                    path.display()
                );
            }

            TestbedConfig::example().save(&path)?;
            println!("✓ Configuration file created: {}", path.display());
            println!("\nEdit the file to customize your settings.");
        }

        ConfigAction::Show { json } => {
            let config = load_config(path)?;
            let output = if json {
                serde_json::to_string_pretty(&config)?
            } else {
                serde_yaml::to_string(&config)?
            };
            println!("{output}");
        }

        ConfigAction::Validate => match load_config(path) {
            Ok(config) => {
                println!("✓ Configuration is valid");
                println!("  VM:     {} on {}", config.eve.name, config.eve.backend);
                println!("  Source: {}", config.sync.source);
            }
            Err(e) => {
                println!("✗ Configuration is invalid");
                println!("  Error: {e:#}");
                return Err(e);
            }
        },

        ConfigAction::Env => EnvConfig::load().print_summary(),
    }

    Ok(())
}
