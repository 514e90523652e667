// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # MCP Streamable-HTTP Client
//!
//! Implements the app invocation contract against apps that speak MCP over
//! HTTP. One [`McpHttpConnection`] is one MCP session (`mcp-session-id`)
//! opened on behalf of one agent.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** JSON-RPC 2.0 framing, SSE response decoding, caller-context
//!   header propagation
//!
//! ## Session lifecycle
//!
//! 1. `initialize` POST; the session id comes back in a response header
//! 2. `notifications/initialized` (best effort)
//! 3. `tools/list` / `tools/call` carrying the session header
//! 4. `DELETE` on close (best effort)
//!
//! A 404 or a connection-level failure means the remote session is gone and
//! surfaces as [`InvocationError::Disconnected`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::domain::agent::AgentId;
use crate::domain::app::AppRecord;
use crate::domain::invocation::{
    AppConnection, AppConnector, CallerContext, InvocationError, ToolDescriptor, AGENT_ID_HEADER,
};

pub const PROTOCOL_VERSION: &str = "2025-11-25";
const SESSION_HEADER: &str = "mcp-session-id";
const LEGACY_SESSION_HEADER: &str = "x-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const ACCEPT_VALUE: &str = "application/json, text/event-stream";
const MAX_TOOL_PAGES: usize = 32;

// JSON-RPC types

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params: Some(params),
        }
    }

    fn notification(method: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Opens MCP sessions over streamable HTTP
#[derive(Clone)]
pub struct McpHttpConnector {
    client: reqwest::Client,
    close_timeout: Duration,
}

impl McpHttpConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            close_timeout: connect_timeout,
        })
    }
}

#[async_trait]
impl AppConnector for McpHttpConnector {
    async fn connect(
        &self,
        app: &AppRecord,
        agent_id: AgentId,
    ) -> Result<Arc<dyn AppConnection>, InvocationError> {
        let endpoint = app.card.mcp_endpoint.clone();
        let request = JsonRpcRequest::call(
            0,
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "agentbus",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        );

        let response = self
            .client
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_VALUE)
            .header(AGENT_ID_HEADER, agent_id.to_string())
            .json(&request)
            .send()
            .await
            .map_err(|e| InvocationError::Handshake(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InvocationError::Handshake(format!(
                "initialize returned HTTP {}",
                status
            )));
        }

        let session_id = [SESSION_HEADER, LEGACY_SESSION_HEADER]
            .iter()
            .find_map(|name| response.headers().get(*name))
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| InvocationError::Handshake("no session id in initialize response".to_string()))?;

        let is_sse = is_event_stream(&response);
        let body = response
            .text()
            .await
            .map_err(|e| InvocationError::Handshake(e.to_string()))?;
        let init = decode_body(&body, is_sse, 0).map_err(|e| InvocationError::Handshake(e.to_string()))?;
        if let Some(error) = init.error {
            return Err(InvocationError::Handshake(format!(
                "initialize failed ({}): {}",
                error.code, error.message
            )));
        }
        let protocol_version = init
            .result
            .as_ref()
            .and_then(|r| r.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION)
            .to_string();

        let connection = McpHttpConnection {
            client: self.client.clone(),
            close_timeout: self.close_timeout,
            endpoint,
            session_id,
            agent_id,
            protocol_version,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        };
        connection.notify_initialized().await;

        info!(
            agent_id = %agent_id,
            app_id = %app.id,
            session = %connection.session_id,
            "MCP session established"
        );
        Ok(Arc::new(connection))
    }
}

pub struct McpHttpConnection {
    client: reqwest::Client,
    close_timeout: Duration,
    endpoint: String,
    session_id: String,
    agent_id: AgentId,
    protocol_version: String,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl McpHttpConnection {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn post(&self) -> reqwest::RequestBuilder {
        self.client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_VALUE)
            .header(SESSION_HEADER, &self.session_id)
            .header(PROTOCOL_HEADER, &self.protocol_version)
    }

    async fn notify_initialized(&self) {
        let result = self
            .post()
            .header(AGENT_ID_HEADER, self.agent_id.to_string())
            .json(&JsonRpcRequest::notification("notifications/initialized"))
            .send()
            .await;
        if let Err(e) = result {
            debug!(error = %e, "initialized notification failed; continuing");
        }
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    async fn rpc(
        &self,
        method: &str,
        params: Value,
        headers: Vec<(String, String)>,
    ) -> Result<Value, InvocationError> {
        if !self.is_alive() {
            return Err(InvocationError::Disconnected("session already closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut builder = self.post();
        for (name, value) in headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .json(&JsonRpcRequest::call(id, method, params))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    self.mark_dead();
                    InvocationError::Disconnected(e.to_string())
                } else {
                    InvocationError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            self.mark_dead();
            return Err(InvocationError::Disconnected(format!(
                "session {} no longer exists on the app",
                self.session_id
            )));
        }
        if !status.is_success() {
            return Err(InvocationError::Transport(format!("{} returned HTTP {}", method, status)));
        }

        let is_sse = is_event_stream(&response);
        let body = response
            .text()
            .await
            .map_err(|e| InvocationError::Transport(e.to_string()))?;
        let decoded = decode_body(&body, is_sse, id)?;

        if let Some(error) = decoded.error {
            return Err(InvocationError::Rejected {
                code: error.code,
                message: error.message,
            });
        }
        decoded
            .result
            .ok_or_else(|| InvocationError::Protocol(format!("{} response has neither result nor error", method)))
    }
}

#[async_trait]
impl AppConnection for McpHttpConnection {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, InvocationError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let headers = CallerContext::default().outbound_headers(self.agent_id);
            let result = self.rpc("tools/list", params, headers).await?;

            if let Some(page) = result.get("tools").and_then(Value::as_array) {
                for tool in page.iter().filter(|t| !t.is_null()) {
                    let descriptor: ToolDescriptor = serde_json::from_value(tool.clone())
                        .map_err(|e| InvocationError::Protocol(format!("invalid tool entry: {}", e)))?;
                    tools.push(descriptor);
                }
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(tools);
            }
        }

        warn!(endpoint = %self.endpoint, "tools/list pagination did not terminate; truncating");
        Ok(tools)
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        caller: &CallerContext,
    ) -> Result<Value, InvocationError> {
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let mut params = json!({ "name": tool, "arguments": arguments });
        if !caller.metadata.is_empty() {
            params["_meta"] = Value::Object(caller.metadata.clone());
        }

        match self
            .rpc("tools/call", params, caller.outbound_headers(self.agent_id))
            .await
        {
            Err(InvocationError::Rejected { code, message }) if is_unknown_tool(code, &message) => {
                Err(InvocationError::ToolNotFound(tool.to_string()))
            }
            other => other,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let result = self
            .client
            .delete(&self.endpoint)
            .header(SESSION_HEADER, &self.session_id)
            .timeout(self.close_timeout)
            .send()
            .await;
        if let Err(e) = result {
            debug!(session = %self.session_id, error = %e, "MCP session DELETE failed");
        }
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

fn is_unknown_tool(code: i64, message: &str) -> bool {
    if code == -32601 {
        return true;
    }
    let message = message.to_ascii_lowercase();
    message.contains("unknown tool") || (message.contains("tool") && message.contains("not found"))
}

/// Decode a JSON-RPC response from either a plain JSON body or an SSE stream.
///
/// In a stream, the first `data:` payload that is a response to `id` wins;
/// server notifications interleaved before it are skipped.
fn decode_body(body: &str, is_sse: bool, id: u64) -> Result<JsonRpcResponse, InvocationError> {
    let looks_like_sse = is_sse || body.trim_start().starts_with("event:") || body.trim_start().starts_with("data:");
    if !looks_like_sse {
        return serde_json::from_str(body)
            .map_err(|e| InvocationError::Protocol(format!("invalid JSON-RPC body: {}", e)));
    }

    body.lines()
        .filter_map(|line| line.trim().strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
        .find(|response| {
            let answers = response.result.is_some() || response.error.is_some();
            let matches_id = match &response.id {
                Some(value) => value.as_u64() == Some(id),
                None => true,
            };
            answers && matches_id
        })
        .ok_or_else(|| InvocationError::Protocol("no JSON-RPC response in event stream".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::app::AppCard;
    use chrono::Utc;
    use mockito::Matcher;

    fn app(server: &mockito::ServerGuard) -> AppRecord {
        AppRecord::new(
            AppCard::new("lookup", format!("{}/mcp", server.url()), format!("{}/health", server.url())),
            Utc::now(),
        )
    }

    async fn mock_initialize(server: &mut mockito::ServerGuard, session: &str) -> mockito::Mock {
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({ "method": "initialize" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("mcp-session-id", session)
            .with_body(r#"{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-11-25","capabilities":{}}}"#)
            .create_async()
            .await
    }

    async fn mock_initialized(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({ "method": "notifications/initialized" })))
            .with_status(202)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_call_tool_over_sse_propagates_caller_context() {
        let mut server = mockito::Server::new_async().await;
        let agent_id = AgentId::new();
        mock_initialize(&mut server, "s-1").await;
        mock_initialized(&mut server).await;
        let call = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({
                "method": "tools/call",
                "params": { "name": "lookup", "arguments": { "q": "a" }, "_meta": { "trace": "t-9" } }
            })))
            .match_header("mcp-session-id", "s-1")
            .match_header("x-agent-id", agent_id.to_string().as_str())
            .match_header("x-mcp-metadata", r#"{"trace":"t-9"}"#)
            .match_header("authorization", "Bearer abc")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(
                "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"found a\"}],\"isError\":false}}\n\n",
            )
            .create_async()
            .await;

        let connector = McpHttpConnector::new(Duration::from_secs(2)).unwrap();
        let connection = connector.connect(&app(&server), agent_id).await.unwrap();

        let caller = CallerContext::default()
            .with_header("Authorization", "Bearer abc")
            .with_header("Host", "bus.internal")
            .with_metadata("trace", json!("t-9"));
        let result = connection
            .call_tool("lookup", json!({ "q": "a" }), &caller)
            .await
            .unwrap();

        assert_eq!(
            result,
            json!({ "content": [{ "type": "text", "text": "found a" }], "isError": false })
        );
        call.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_tool_maps_to_tool_not_found() {
        let mut server = mockito::Server::new_async().await;
        mock_initialize(&mut server, "s-2").await;
        mock_initialized(&mut server).await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({ "method": "tools/call" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Unknown tool: nope"}}"#)
            .create_async()
            .await;

        let connection = McpHttpConnector::new(Duration::from_secs(2))
            .unwrap()
            .connect(&app(&server), AgentId::new())
            .await
            .unwrap();
        let err = connection
            .call_tool("nope", Value::Null, &CallerContext::default())
            .await
            .unwrap_err();

        assert_eq!(err, InvocationError::ToolNotFound("nope".to_string()));
        assert!(connection.is_alive());
    }

    #[tokio::test]
    async fn test_expired_remote_session_is_disconnected() {
        let mut server = mockito::Server::new_async().await;
        mock_initialize(&mut server, "s-3").await;
        mock_initialized(&mut server).await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({ "method": "tools/list" })))
            .with_status(404)
            .create_async()
            .await;

        let connection = McpHttpConnector::new(Duration::from_secs(2))
            .unwrap()
            .connect(&app(&server), AgentId::new())
            .await
            .unwrap();

        let err = connection.list_tools().await.unwrap_err();
        assert!(matches!(err, InvocationError::Disconnected(_)));
        assert!(!connection.is_alive());
    }

    #[tokio::test]
    async fn test_missing_session_header_fails_handshake() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":0,"result":{}}"#)
            .create_async()
            .await;

        let result = McpHttpConnector::new(Duration::from_secs(2))
            .unwrap()
            .connect(&app(&server), AgentId::new())
            .await;
        assert!(matches!(result, Err(InvocationError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let mut server = mockito::Server::new_async().await;
        mock_initialize(&mut server, "s-4").await;
        mock_initialized(&mut server).await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({ "method": "tools/list", "params": { "cursor": "p2" } })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"b","inputSchema":{"type":"object"}}]}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({ "method": "tools/list" })),
                Matcher::Regex(r#""params":\{\}"#.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"a","description":"first","inputSchema":{}}],"nextCursor":"p2"}}"#)
            .create_async()
            .await;

        let connection = McpHttpConnector::new(Duration::from_secs(2))
            .unwrap()
            .connect(&app(&server), AgentId::new())
            .await
            .unwrap();
        let tools = connection.list_tools().await.unwrap();

        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(tools[0].description.as_deref(), Some("first"));
    }

    #[test]
    fn test_decode_skips_notifications_in_stream() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\n";
        let decoded = decode_body(body, true, 7).unwrap();
        assert_eq!(decoded.result, Some(json!({ "ok": true })));
    }

    #[test]
    fn test_unknown_tool_detection() {
        assert!(is_unknown_tool(-32601, "Method not found"));
        assert!(is_unknown_tool(-32602, "Tool 'x' not found"));
        assert!(!is_unknown_tool(-32603, "database offline"));
    }
}
