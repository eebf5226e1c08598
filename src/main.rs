mod archive;
mod common;
mod config;
mod control_plane;
mod download;
mod driver;
mod identity;
mod lock;
mod logging;
mod manifest;
mod orchestrator;
mod replace;
mod supervisor;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::config::AgentConfig;
use crate::control_plane::ControlPlaneClient;
use crate::identity::node_id;
use crate::logging::Logging;
use crate::manifest::Manifest;
use crate::supervisor::SupervisorCtl;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct UserArgs {
    #[command(subcommand)]
    command: Option<Command>,

    /// Verbose logging to stderr instead of LOG_FILE
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Query the control plane for every tracked binary and update as needed (default)
    Run,

    /// Restore a binary to a previously-archived hash without contacting the control plane
    Rollback {
        /// Binary name as it appears in the manifest
        binary_name: String,
        /// Hex SHA-256 of the archived version to restore
        target_hash: String,
    },

    /// Print the current manifest as a table
    Status,
}

#[derive(Tabled)]
struct BinaryRow {
    #[tabled(rename = "binary")]
    binary_name: String,
    #[tabled(rename = "version")]
    version: String,
    #[tabled(rename = "previous")]
    previous_version: String,
}

fn init_logging(config: &AgentConfig, verbose: bool) -> Result<()> {
    let mut logging = Logging::new().with_debug_mode(verbose);
    if !verbose && let Some(log_file) = &config.log_file {
        logging = logging.with_file(log_file.clone());
    }
    logging.start()
}

fn main() -> Result<()> {
    let args = UserArgs::parse();
    let config = AgentConfig::from_env().context("Unable to load configuration")?;

    init_logging(&config, args.verbose)?;

    crate::config::ensure_dir(&config.lock_dir)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&config),
        Command::Rollback { binary_name, target_hash } => rollback(&config, &binary_name, &target_hash),
        Command::Status => status(&config),
    }
}

fn run(config: &AgentConfig) -> Result<()> {
    let supervisor = SupervisorCtl;
    crate::driver::run(config, &supervisor)
}

fn rollback(config: &AgentConfig, binary_name: &str, target_hash: &str) -> Result<()> {
    let manifest = Manifest::load(&config.bin_manifests)?;
    let current_hash = manifest.find(binary_name).map(|b| b.version.clone()).unwrap_or_default();

    let control_plane = ControlPlaneClient::new(config);
    let supervisor = SupervisorCtl;
    let node_name = node_id();

    let outcome = crate::orchestrator::rollback(
        config,
        &control_plane,
        &supervisor,
        &node_name,
        binary_name,
        &current_hash,
        target_hash,
    )?;

    if let Some(installed_hash) = outcome.installed_hash {
        let mut manifest = manifest;
        manifest.update_binary(binary_name, &installed_hash);
        manifest.save(&config.bin_manifests)?;
        Ok(())
    } else {
        anyhow::bail!("rollback of {binary_name} to {target_hash} did not complete");
    }
}

fn status(config: &AgentConfig) -> Result<()> {
    let manifest = Manifest::load(&config.bin_manifests)?;

    let rows: Vec<BinaryRow> = manifest
        .binaries
        .iter()
        .map(|b| BinaryRow {
            binary_name: b.binary_name.clone(),
            version: b.version.clone(),
            previous_version: b.previous_version.clone(),
        })
        .collect();

    println!(
        "node: {} ({}, {})",
        manifest.node_info.node_name, manifest.node_info.os_release, manifest.node_info.cpu_arch
    );
    println!("{}", Table::new(rows).with(Style::rounded()));

    Ok(())
}
