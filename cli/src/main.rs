// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # agentbus
//!
//! Process bootstrap for an agentbus node.
//!
//! ## Commands
//!
//! - `agentbus serve` - Run the bus with its background loops until Ctrl-C
//! - `agentbus config show|validate|generate` - Configuration management
//! - `agentbus probe <url>` - One-shot health probe
//! - `agentbus tools <endpoint>` - List the tools of an MCP app

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use agentbus_cli::commands::{self, ConfigCommand, ProbeArgs, ServeArgs, ToolsArgs};
use agentbus_core::domain::bus_config::BusConfigManifest;

/// agentbus - lifecycle and proxy layer between agents and apps
#[derive(Parser)]
#[command(name = "agentbus")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "AGENTBUS_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(long, global = true, env = "AGENTBUS_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service bus
    #[command(name = "serve")]
    Serve(ServeArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Probe a health-check URL once
    #[command(name = "probe")]
    Probe(ProbeArgs),

    /// Open an MCP session and list its tools
    #[command(name = "tools")]
    Tools(ToolsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = match cli.log_level.clone() {
        Some(level) => level,
        None => BusConfigManifest::load_or_default(cli.config.clone())
            .map(|config| config.spec.observability.log_level)
            .unwrap_or_else(|_| "info".to_string()),
    };
    init_logging(&level)?;

    match cli.command {
        Commands::Serve(args) => commands::serve::run(args, cli.config).await,
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
        Commands::Probe(args) => commands::probe::run(args).await,
        Commands::Tools(args) => commands::tools::run(args).await,
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
