// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `agentbus tools`: open one MCP session against an endpoint, list its
//! tools, close the session.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;

use agentbus_core::domain::agent::AgentId;
use agentbus_core::domain::app::{AppCard, AppRecord};
use agentbus_core::domain::invocation::{AppConnection, AppConnector, ToolDescriptor};
use agentbus_core::infrastructure::McpHttpConnector;

#[derive(Args, Debug)]
pub struct ToolsArgs {
    /// MCP streamable-HTTP endpoint
    #[arg(value_name = "ENDPOINT")]
    endpoint: String,

    /// Connect timeout
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Print the raw descriptors as JSON
    #[arg(long)]
    json: bool,
}

pub async fn run(args: ToolsArgs) -> Result<()> {
    let tools = fetch(&args.endpoint, args.timeout).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    println!("{}", format!("{} tool(s) at {}", tools.len(), args.endpoint).bold());
    for tool in &tools {
        match &tool.description {
            Some(description) => println!("  {} - {}", tool.name.bold(), description),
            None => println!("  {}", tool.name.bold()),
        }
    }
    Ok(())
}

async fn fetch(endpoint: &str, timeout: Duration) -> Result<Vec<ToolDescriptor>> {
    let connector = McpHttpConnector::new(timeout).context("Failed to build HTTP client")?;
    let app = AppRecord::new(AppCard::new("cli", endpoint, endpoint), Utc::now());

    let connection = connector
        .connect(&app, AgentId::new())
        .await
        .with_context(|| format!("Failed to open MCP session at {}", endpoint))?;
    let tools = connection.list_tools().await;
    connection.close().await;
    tools.context("tools/list failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_lists_and_closes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({ "method": "initialize" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("mcp-session-id", "cli-1")
            .with_body(r#"{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-11-25","capabilities":{}}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({ "method": "notifications/initialized" })))
            .with_status(202)
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({ "method": "tools/list" })))
            .match_header("mcp-session-id", "cli-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"forecast","description":"Weather forecast","inputSchema":{"type":"object"}}]}}"#,
            )
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/mcp")
            .match_header("mcp-session-id", "cli-1")
            .with_status(200)
            .create_async()
            .await;

        let tools = fetch(&format!("{}/mcp", server.url()), Duration::from_secs(2)).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "forecast");
        assert_eq!(tools[0].description.as_deref(), Some("Weather forecast"));
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_fails_without_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":0,"result":{}}"#)
            .create_async()
            .await;

        let err = fetch(&format!("{}/mcp", server.url()), Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("Failed to open MCP session"));
    }
}
