//! VM Harness CLI
//!
//! Offline companion to the harness library: lists the step catalog,
//! validates scenario plans, checks captured traffic dumps against an
//! allow-list and shows the effective configuration.

#![forbid(unsafe_code)]

mod commands;
mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vmh")]
#[command(author, version, about = "VM Harness - end-to-end test orchestration toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write JSON logs to this directory
    #[arg(long, global = true, env = "VMH_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Configuration file (default: ~/.config/vmh/config.toml)
    #[arg(short, long, global = true, env = "VMH_CONFIG")]
    config: Option<PathBuf>,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in steps and their parameters
    Steps,

    /// Work with scenario plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },

    /// Check captured traffic against allowed endpoints
    Traffic {
        #[command(subcommand)]
        action: TrafficAction,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Validate scenario files without running them
    Check {
        /// Scenario TOML files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
enum TrafficAction {
    /// Fail when a flow dump contains a connection to a non-allowed endpoint
    Check {
        /// Flow dump, one JSON flow per line
        flows: PathBuf,

        /// Allowed endpoint (address:port); repeatable
        #[arg(short, long = "allow", value_name = "ADDR:PORT")]
        allow: Vec<String>,

        /// File with one allowed endpoint per line
        #[arg(long, value_name = "FILE")]
        allow_file: Vec<PathBuf>,

        /// Judge every frame, not just the first frame of each connection
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration and where each value came from
    Show,
    /// Report configuration problems; fails on errors
    Validate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.verbose, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Steps => commands::list_steps(cli.json),
        Commands::Plan {
            action: PlanAction::Check { files },
        } => commands::check_plans(&files, cli.json),
        Commands::Traffic {
            action:
                TrafficAction::Check {
                    flows,
                    allow,
                    allow_file,
                    strict,
                },
        } => commands::check_traffic(&flows, &allow, &allow_file, strict, cli.json),
        Commands::Config {
            action: ConfigAction::Show,
        } => commands::show_config(cli.config.as_deref(), cli.json),
        Commands::Config {
            action: ConfigAction::Validate,
        } => commands::validate_config(cli.config.as_deref(), cli.json),
    }
}
