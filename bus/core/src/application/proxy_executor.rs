// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Proxy Executor
//!
//! Forwards one tool invocation from an agent to an app:
//!
//! 1. resolve the app (`app_not_found`, `app_unhealthy`)
//! 2. get or create the agent's session (`session_unavailable`)
//! 3. call the tool with the caller's context, bounded by `call_timeout`
//! 4. return the app's result untouched, or a normalized error
//!
//! A timed-out call is never retried; the tool may have side effects. A
//! connection that drops mid-call is replaced once and the call reissued.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::session_manager::{AppSession, SessionManager};
use crate::domain::agent::AgentId;
use crate::domain::app::{AppDirectory, AppId};
use crate::domain::error::BusError;
use crate::domain::invocation::{CallerContext, InvocationError};

pub struct ProxyExecutor {
    apps: Arc<dyn AppDirectory>,
    sessions: Arc<SessionManager>,
    call_timeout: Duration,
}

impl ProxyExecutor {
    pub fn new(apps: Arc<dyn AppDirectory>, sessions: Arc<SessionManager>, call_timeout: Duration) -> Self {
        Self {
            apps,
            sessions,
            call_timeout,
        }
    }

    pub async fn execute(
        &self,
        agent_id: AgentId,
        app_id: AppId,
        tool: &str,
        arguments: Value,
        caller: &CallerContext,
    ) -> Result<Value, BusError> {
        let started = Instant::now();
        let result = self.dispatch(agent_id, app_id, tool, arguments, caller).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        counter!("agentbus_proxy_calls_total", "outcome" => outcome).increment(1);
        histogram!("agentbus_proxy_call_duration_seconds").record(started.elapsed().as_secs_f64());

        match &result {
            Ok(_) => debug!(agent_id = %agent_id, app_id = %app_id, tool, elapsed = ?started.elapsed(), "Tool call succeeded"),
            Err(e) => debug!(agent_id = %agent_id, app_id = %app_id, tool, error = %e, "Tool call failed"),
        }
        result
    }

    async fn dispatch(
        &self,
        agent_id: AgentId,
        app_id: AppId,
        tool: &str,
        arguments: Value,
        caller: &CallerContext,
    ) -> Result<Value, BusError> {
        let app = self.apps.resolve(app_id).await?;
        if !app.healthy {
            return Err(BusError::AppUnhealthy { app_id });
        }

        let mut session = self.sessions.get_or_create(agent_id, app_id).await?;
        let mut retried = false;

        loop {
            let outcome = self.call(&session, tool, arguments.clone(), caller).await;
            session.touch();

            match outcome {
                Ok(value) => return Ok(value),
                Err(CallFailure::TimedOut) => {
                    return Err(BusError::UpstreamTimeout {
                        app_id,
                        tool: tool.to_string(),
                        timeout: self.call_timeout,
                    })
                }
                Err(CallFailure::Invocation(InvocationError::Disconnected(reason))) => {
                    if retried {
                        self.sessions.discard(&session).await;
                        return Err(BusError::SessionUnavailable {
                            agent_id,
                            app_id,
                            reason,
                        });
                    }
                    warn!(agent_id = %agent_id, app_id = %app_id, reason = %reason, "Session lost mid-call; reconnecting once");
                    retried = true;
                    session = self.sessions.replace_broken(&session).await?;
                }
                Err(CallFailure::Invocation(InvocationError::ToolNotFound(_))) => {
                    return Err(BusError::ToolNotFound {
                        app_id,
                        tool: tool.to_string(),
                    })
                }
                Err(CallFailure::Invocation(InvocationError::Rejected { message, .. })) => {
                    return Err(BusError::UpstreamError { app_id, message })
                }
                Err(CallFailure::Invocation(other)) => {
                    return Err(BusError::UpstreamError {
                        app_id,
                        message: other.to_string(),
                    })
                }
            }
        }
    }

    async fn call(
        &self,
        session: &AppSession,
        tool: &str,
        arguments: Value,
        caller: &CallerContext,
    ) -> Result<Value, CallFailure> {
        match tokio::time::timeout(self.call_timeout, session.connection().call_tool(tool, arguments, caller)).await {
            Ok(result) => result.map_err(CallFailure::Invocation),
            Err(_) => Err(CallFailure::TimedOut),
        }
    }
}

enum CallFailure {
    TimedOut,
    Invocation(InvocationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::session_manager::tests::{CountingConnector, FakeConnection, StaticDirectory};
    use crate::domain::app::{AppCard, AppRecord};
    use crate::domain::bus_config::SessionConfig;
    use crate::domain::error::FailureOrigin;
    use crate::domain::invocation::{AppConnection, AppConnector, ToolDescriptor};
    use crate::infrastructure::event_bus::EventBus;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connection whose call outcomes are scripted in order
    struct ScriptedConnection {
        script: Mutex<VecDeque<Scripted>>,
        seen_caller: Mutex<Option<CallerContext>>,
    }

    enum Scripted {
        Reply(Result<Value, InvocationError>),
        Hang,
    }

    #[async_trait]
    impl AppConnection for ScriptedConnection {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, InvocationError> {
            Ok(Vec::new())
        }

        async fn call_tool(&self, _tool: &str, _arguments: Value, caller: &CallerContext) -> Result<Value, InvocationError> {
            *self.seen_caller.lock() = Some(caller.clone());
            let next = self.script.lock().pop_front();
            match next {
                Some(Scripted::Reply(result)) => result,
                Some(Scripted::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }
                None => Err(InvocationError::Disconnected("script exhausted".to_string())),
            }
        }

        fn is_alive(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    /// Hands out one scripted connection per connect
    struct ScriptedConnector {
        connections: Mutex<VecDeque<Arc<ScriptedConnection>>>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Vec<Scripted>>) -> Arc<Self> {
            Arc::new(Self {
                connections: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|s| {
                            Arc::new(ScriptedConnection {
                                script: Mutex::new(s.into()),
                                seen_caller: Mutex::new(None),
                            })
                        })
                        .collect(),
                ),
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AppConnector for ScriptedConnector {
        async fn connect(&self, _app: &AppRecord, _agent_id: AgentId) -> Result<Arc<dyn AppConnection>, InvocationError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.connections.lock().pop_front() {
                Some(connection) => Ok(connection),
                None => Err(InvocationError::Handshake("no more connections".to_string())),
            }
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            ttl: Duration::from_secs(1800),
            max_per_agent: 10,
            sweep_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn executor(
        directory: Arc<StaticDirectory>,
        connector: Arc<dyn AppConnector>,
        call_timeout: Duration,
    ) -> (ProxyExecutor, Arc<SessionManager>) {
        let sessions = Arc::new(SessionManager::new(
            directory.clone(),
            connector,
            session_config(),
            EventBus::new(64),
        ));
        (ProxyExecutor::new(directory, sessions.clone(), call_timeout), sessions)
    }

    #[tokio::test]
    async fn test_result_is_returned_unmodified_and_session_reused() {
        let directory = Arc::new(StaticDirectory::default());
        let app = directory.with_app("b");
        let connector = Arc::new(CountingConnector::default());
        let (proxy, sessions) = executor(directory, connector.clone(), Duration::from_secs(5));
        let agent = AgentId::new();

        let first = proxy
            .execute(agent, app, "lookup", json!({ "q": "a" }), &CallerContext::default())
            .await
            .unwrap();
        assert_eq!(first, json!({ "tool": "lookup", "echo": { "q": "a" } }));

        let before = sessions.active_sessions(Some(agent))[0].last_used_at;
        proxy
            .execute(agent, app, "lookup", json!({ "q": "b" }), &CallerContext::default())
            .await
            .unwrap();
        let after = &sessions.active_sessions(Some(agent))[0];

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(after.last_used_at >= before);
        let opened: Vec<Arc<FakeConnection>> = connector.opened.lock().clone();
        assert_eq!(opened[0].calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_unhealthy_apps() {
        let directory = Arc::new(StaticDirectory::default());
        let mut sick = AppRecord::new(AppCard::new("sick", "http://sick/mcp", "http://sick/health"), Utc::now());
        sick.record_failure();
        let sick_id = sick.id;
        directory.apps.lock().insert(sick_id, sick);
        let connector = Arc::new(CountingConnector::default());
        let (proxy, _) = executor(directory, connector.clone(), Duration::from_secs(5));
        let caller = CallerContext::default();

        let err = proxy.execute(AgentId::new(), AppId::new(), "t", Value::Null, &caller).await.unwrap_err();
        assert_eq!(err.kind(), "app_not_found");
        assert_eq!(err.origin(), FailureOrigin::AppUnreachable);

        let err = proxy.execute(AgentId::new(), sick_id, "t", Value::Null, &caller).await.unwrap_err();
        assert_eq!(err, BusError::AppUnhealthy { app_id: sick_id });
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_session_unavailable() {
        let directory = Arc::new(StaticDirectory::default());
        let app = directory.with_app("b");
        let connector = Arc::new(CountingConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let (proxy, _) = executor(directory, connector, Duration::from_secs(5));

        let err = proxy
            .execute(AgentId::new(), app, "lookup", Value::Null, &CallerContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_unavailable");
    }

    #[tokio::test]
    async fn test_tool_errors_are_classified() {
        let directory = Arc::new(StaticDirectory::default());
        let app = directory.with_app("b");
        let connector = ScriptedConnector::new(vec![vec![
            Scripted::Reply(Err(InvocationError::ToolNotFound("nope".to_string()))),
            Scripted::Reply(Err(InvocationError::Rejected {
                code: -32603,
                message: "database offline".to_string(),
            })),
        ]]);
        let (proxy, _) = executor(directory, connector, Duration::from_secs(5));
        let agent = AgentId::new();
        let caller = CallerContext::default();

        let err = proxy.execute(agent, app, "nope", Value::Null, &caller).await.unwrap_err();
        assert_eq!(
            err,
            BusError::ToolNotFound {
                app_id: app,
                tool: "nope".to_string()
            }
        );
        assert_eq!(err.origin(), FailureOrigin::ToolRejected);

        let err = proxy.execute(agent, app, "lookup", Value::Null, &caller).await.unwrap_err();
        assert_eq!(
            err,
            BusError::UpstreamError {
                app_id: app,
                message: "database offline".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let directory = Arc::new(StaticDirectory::default());
        let app = directory.with_app("b");
        let connector = ScriptedConnector::new(vec![vec![Scripted::Hang]]);
        let (proxy, _) = executor(directory, connector.clone(), Duration::from_millis(30));

        let err = proxy
            .execute(AgentId::new(), app, "slow", Value::Null, &CallerContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UpstreamTimeout { .. }));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_reconnects_once() {
        let directory = Arc::new(StaticDirectory::default());
        let app = directory.with_app("b");
        let connector = ScriptedConnector::new(vec![
            vec![Scripted::Reply(Err(InvocationError::Disconnected("404".to_string())))],
            vec![Scripted::Reply(Ok(json!({ "content": [], "isError": false })))],
        ]);
        let (proxy, _) = executor(directory, connector.clone(), Duration::from_secs(5));

        let value = proxy
            .execute(AgentId::new(), app, "lookup", Value::Null, &CallerContext::default())
            .await
            .unwrap();
        assert_eq!(value, json!({ "content": [], "isError": false }));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_disconnect_surfaces_session_unavailable() {
        let directory = Arc::new(StaticDirectory::default());
        let app = directory.with_app("b");
        let connector = ScriptedConnector::new(vec![
            vec![Scripted::Reply(Err(InvocationError::Disconnected("gone".to_string())))],
            vec![Scripted::Reply(Err(InvocationError::Disconnected("still gone".to_string())))],
        ]);
        let (proxy, sessions) = executor(directory, connector.clone(), Duration::from_secs(5));
        let agent = AgentId::new();

        let err = proxy
            .execute(agent, app, "lookup", Value::Null, &CallerContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_unavailable");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert!(sessions.active_sessions(Some(agent)).is_empty());
    }

    #[tokio::test]
    async fn test_caller_context_reaches_connection() {
        let directory = Arc::new(StaticDirectory::default());
        let app = directory.with_app("b");
        let connector = ScriptedConnector::new(vec![vec![Scripted::Reply(Ok(json!({})))]]);
        let connection = connector.connections.lock()[0].clone();
        let (proxy, _) = executor(directory, connector, Duration::from_secs(5));

        let caller = CallerContext::default()
            .with_header("Authorization", "Bearer t")
            .with_metadata("trace", json!("t-1"));
        proxy
            .execute(AgentId::new(), app, "lookup", Value::Null, &caller)
            .await
            .unwrap();

        assert_eq!(connection.seen_caller.lock().as_ref(), Some(&caller));
    }
}
