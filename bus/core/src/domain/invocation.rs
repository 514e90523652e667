// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! App Invocation Contract
//!
//! The bus does not speak any app protocol itself. An [`AppConnector`] opens
//! one stateful [`AppConnection`] per (agent, app) pair; the session manager
//! decides how many exist, how they are keyed, bounded and recycled.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Collaborator traits plus caller-context propagation rules
//! - **Implementation:** `crate::infrastructure::mcp_client` (streamable HTTP MCP)

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::agent::AgentId;
use crate::domain::app::AppRecord;

pub const AGENT_ID_HEADER: &str = "X-Agent-ID";
pub const METADATA_HEADER: &str = "X-MCP-Metadata";

/// Headers that never travel from the caller to an app
const BLOCKED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "content-type",
    "accept",
    "mcp-session-id",
    "x-agent-id",
];

/// Identity-adjacent context of the invoking agent: the headers of its
/// original request and any protocol-level metadata it attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallerContext {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CallerContext {
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Headers to send downstream on behalf of `agent_id`.
    ///
    /// Caller headers pass through except hop-by-hop and protocol headers;
    /// the agent id header is always the resolved identity, never the
    /// caller-supplied one.
    pub fn outbound_headers(&self, agent_id: AgentId) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(name, _)| !BLOCKED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        headers.push((AGENT_ID_HEADER.to_string(), agent_id.to_string()));
        if !self.metadata.is_empty() {
            headers.push((METADATA_HEADER.to_string(), Value::Object(self.metadata.clone()).to_string()));
        }
        headers
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    /// The connection or remote session is gone; a fresh connection may work
    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("app rejected the call ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Protocol(String),
}

/// A live, stateful connection to one app on behalf of one agent
#[async_trait]
pub trait AppConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, InvocationError>;

    /// Invoke `tool`; the returned value is the app's result object untouched
    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        caller: &CallerContext,
    ) -> Result<Value, InvocationError>;

    /// False once the connection is known to be unusable
    fn is_alive(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait AppConnector: Send + Sync {
    async fn connect(
        &self,
        app: &AppRecord,
        agent_id: AgentId,
    ) -> Result<Arc<dyn AppConnection>, InvocationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_headers_filter_and_override_identity() {
        let agent_id = AgentId::new();
        let caller = CallerContext::default()
            .with_header("Authorization", "Bearer abc")
            .with_header("Host", "bus.internal")
            .with_header("Connection", "keep-alive")
            .with_header("x-agent-id", "spoofed")
            .with_header("X-Trace-Id", "t-1")
            .with_metadata("locale", Value::String("de".to_string()));

        let headers = caller.outbound_headers(agent_id);
        let get = |name: &str| {
            headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .collect::<Vec<_>>()
        };

        assert_eq!(get("authorization"), vec!["Bearer abc"]);
        assert_eq!(get("x-trace-id"), vec!["t-1"]);
        assert!(get("host").is_empty());
        assert!(get("connection").is_empty());
        assert_eq!(get("x-agent-id"), vec![agent_id.to_string().as_str()]);
        assert_eq!(get("x-mcp-metadata"), vec![r#"{"locale":"de"}"#]);
    }

    #[test]
    fn test_no_metadata_header_without_metadata() {
        let headers = CallerContext::default().outbound_headers(AgentId::new());
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, AGENT_ID_HEADER);
    }
}
