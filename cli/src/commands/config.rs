// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use agentbus_core::domain::bus_config::{BusConfigManifest, StorageBackendKind};

const MINIMAL_TEMPLATE: &str = include_str!("../../templates/config-minimal.yaml");
const EXAMPLES_TEMPLATE: &str = include_str!("../../templates/config-with-examples.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./agentbus-config.yaml)
        #[arg(short, long, default_value = "./agentbus-config.yaml")]
        output: PathBuf,

        /// Include every section with comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = BusConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. AGENTBUS_CONFIG_PATH: {}",
            std::env::var("AGENTBUS_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./agentbus-config.yaml");
        println!("  4. ~/.agentbus/config.yaml");
        println!("  5. /etc/agentbus/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Storage:".bold());
    match spec.storage.backend {
        StorageBackendKind::Memory => println!("  Backend: memory"),
        StorageBackendKind::Postgres => {
            println!("  Backend: postgres");
            println!(
                "  URL: {}",
                spec.storage.url.as_deref().map(redact_url).unwrap_or_else(|| "(missing)".to_string())
            );
            println!("  Max connections: {}", spec.storage.max_connections);
        }
    }
    println!("  Key prefix: {}", spec.storage.key_prefix);
    println!();

    println!("{}", "Registries:".bold());
    println!("  Agent TTL: {}", humantime::format_duration(spec.agents.ttl));
    println!(
        "  App health check: every {}, timeout {}, removed after {} failures",
        humantime::format_duration(spec.apps.health_check_interval),
        humantime::format_duration(spec.apps.health_check_timeout),
        spec.apps.unhealthy_threshold
    );
    println!();

    println!("{}", "Sessions & proxy:".bold());
    println!(
        "  Session TTL: {} (max {} per agent)",
        humantime::format_duration(spec.sessions.ttl),
        spec.sessions.max_per_agent
    );
    println!("  Call timeout: {}", humantime::format_duration(spec.proxy.call_timeout));
    println!(
        "  Tool cache: {} entries for {}",
        spec.proxy.tool_cache_capacity,
        humantime::format_duration(spec.proxy.tool_cache_ttl)
    );
    println!();

    println!("{}", "Tasks & messages:".bold());
    println!("  Task TTL: {}", humantime::format_duration(spec.tasks.ttl));
    println!("  Message TTL: {}", humantime::format_duration(spec.messages.ttl));
    println!();

    println!("{}", "Observability:".bold());
    println!("  Log level: {}", spec.observability.log_level);
    if spec.observability.metrics.enabled {
        println!(
            "  Metrics: http://{}:{}/metrics",
            spec.observability.metrics.bind_address, spec.observability.metrics.port
        );
    } else {
        println!("  Metrics: {}", "disabled".dimmed());
    }

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = BusConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        EXAMPLES_TEMPLATE
    } else {
        MINIMAL_TEMPLATE
    };

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

/// Hide the password of a connection URL
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            match credentials.split_once(':') {
                Some((user, _)) => format!("{}{}:****{}", &url[..scheme_end + 3], user, &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_are_valid() {
        for template in [MINIMAL_TEMPLATE, EXAMPLES_TEMPLATE] {
            let config = BusConfigManifest::from_yaml_str(template).unwrap();
            config.validate().unwrap();
        }
    }

    #[tokio::test]
    async fn test_generate_writes_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentbus-config.yaml");
        generate(&path, true).await.unwrap();

        let config = BusConfigManifest::from_yaml_file(&path).unwrap();
        assert_eq!(config.spec.apps.unhealthy_threshold, 3);
        validate(Some(path)).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(
            &path,
            "apiVersion: agentbus/v1\nkind: BusConfig\nmetadata:\n  name: bad\nspec:\n  storage:\n    backend: postgres\n",
        )
        .unwrap();
        assert!(validate(Some(path)).await.is_err());
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("postgres://bus:secret@db:5432/bus"),
            "postgres://bus:****@db:5432/bus"
        );
        assert_eq!(redact_url("postgres://db/bus"), "postgres://db/bus");
    }
}
