//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Edge device VM testbed
#[derive(Parser, Debug)]
#[command(name = "edge-testbed")]
#[command(version)]
#[command(about = "Bring up and tear down edge device VMs for testing")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bootstrap certificates, sync config and start the VM
    Up,

    /// Stop and delete the VM and remove generated files
    Down,

    /// Show context and VM status
    Status,

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write an example configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "edge-testbed.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective configuration
    Show {
        /// Print as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration
    Validate,

    /// List environment overrides
    Env,
}
