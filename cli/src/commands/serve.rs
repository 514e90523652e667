// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `agentbus serve`: run the core with its background loops until a
//! termination signal arrives.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};

use agentbus_core::domain::bus_config::{BusConfigManifest, MetricsConfig};
use agentbus_core::ServiceBus;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Expose Prometheus metrics regardless of configuration
    #[arg(long)]
    metrics: bool,

    /// Override the metrics listener port
    #[arg(long, value_name = "PORT")]
    metrics_port: Option<u16>,
}

pub async fn run(args: ServeArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = BusConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;
    if args.metrics {
        config.spec.observability.metrics.enabled = true;
    }
    if let Some(port) = args.metrics_port {
        config.spec.observability.metrics.port = port;
    }

    if config.spec.observability.metrics.enabled {
        install_metrics_exporter(&config.spec.observability.metrics)?;
    }

    let bus = ServiceBus::builder(config)
        .build()
        .await
        .context("Failed to assemble service bus")?;
    bus.start().await?;
    info!(
        node = %bus.config().metadata.name,
        storage = bus.storage().backend_name(),
        "agentbus node running"
    );

    shutdown_signal().await;

    info!("agentbus node shutting down");
    bus.shutdown().await;
    Ok(())
}

fn install_metrics_exporter(config: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .with_context(|| format!("Invalid metrics listen address {}:{}", config.bind_address, config.port))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Prometheus metrics exposed on http://{}/metrics", addr);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
