// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `agentbus probe`: apply the monitor's health rule to one URL, once.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;

use agentbus_core::domain::health::{HealthProbe, ProbeOutcome};
use agentbus_core::infrastructure::HttpHealthProbe;

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Health-check URL
    #[arg(value_name = "URL")]
    url: String,

    /// Give up after this long
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    timeout: Duration,
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    let outcome = check(&HttpHealthProbe::new(), &args.url, args.timeout).await;
    match &outcome {
        ProbeOutcome::Healthy => {
            println!("{}", format!("✓ {} is healthy", args.url).green());
            Ok(())
        }
        other => {
            println!("{}", format!("✗ {} is not healthy: {}", args.url, describe(other)).red());
            bail!("health probe failed ({})", other.label())
        }
    }
}

async fn check(probe: &dyn HealthProbe, url: &str, timeout: Duration) -> ProbeOutcome {
    probe.probe(url, timeout).await
}

fn describe(outcome: &ProbeOutcome) -> String {
    match outcome {
        ProbeOutcome::Healthy => "healthy".to_string(),
        ProbeOutcome::Unhealthy { status } => format!("status {}", status),
        ProbeOutcome::TimedOut => "timed out".to_string(),
        ProbeOutcome::Unreachable { reason } => format!("unreachable ({})", reason),
    }
}
