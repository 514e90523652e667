// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent-App Session Manager
//!
//! Owns one live [`AppConnection`] per (agent, app) pair.
//!
//! - **Lazy, single-flight:** the first request for a key installs a shared
//!   connect future in the slot map; concurrent requesters await the same
//!   future and observe the same session or the same failure.
//! - **Bounded:** at most `max_per_agent` sessions per agent; the least
//!   recently used ready session is torn down to make room.
//! - **Time-boxed:** `expires_at = last_used_at + ttl`, refreshed on use.
//! - **Self-healing:** a dead connection is discarded on lookup, and
//!   [`SessionManager::replace_broken`] swaps a connection that failed mid-call.
//!
//! The slot map sits behind a short-held synchronous mutex; connecting and
//! closing always happen outside it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::chrono_span;
use crate::application::scheduler::PeriodicJob;
use crate::domain::agent::AgentId;
use crate::domain::app::{AppDirectory, AppId, AppRemovalObserver, AppRemovalReason};
use crate::domain::bus_config::SessionConfig;
use crate::domain::error::{BusError, EntityKind};
use crate::domain::events::BusEvent;
use crate::domain::invocation::{AppConnection, AppConnector};
use crate::domain::session::{SessionCloseReason, SessionId, SessionInfo, SessionKey};
use crate::infrastructure::event_bus::EventBus;

struct Usage {
    at: DateTime<Utc>,
    instant: Instant,
}

/// A pooled connection plus its bookkeeping
pub struct AppSession {
    id: SessionId,
    key: SessionKey,
    connection: Arc<dyn AppConnection>,
    created_at: DateTime<Utc>,
    usage: Mutex<Usage>,
}

impl AppSession {
    fn new(key: SessionKey, connection: Arc<dyn AppConnection>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            key,
            connection,
            created_at: now,
            usage: Mutex::new(Usage {
                at: now,
                instant: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn connection(&self) -> &Arc<dyn AppConnection> {
        &self.connection
    }

    /// Record a use, sliding the expiry window forward
    pub fn touch(&self) {
        let mut usage = self.usage.lock();
        usage.at = Utc::now().max(usage.at);
        usage.instant = Instant::now();
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.usage.lock().at
    }

    fn idle_since(&self) -> Instant {
        self.usage.lock().instant
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.idle_since().elapsed() >= ttl
    }

    pub fn info(&self, ttl: Duration) -> SessionInfo {
        let last_used_at = self.last_used_at();
        SessionInfo {
            key: self.key,
            session_id: self.id,
            created_at: self.created_at,
            last_used_at,
            expires_at: last_used_at + chrono_span(ttl),
        }
    }
}

impl fmt::Debug for AppSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

type ConnectResult = Result<Arc<AppSession>, BusError>;
type SharedConnect = Shared<BoxFuture<'static, ConnectResult>>;

enum Slot {
    Pending { generation: u64, connect: SharedConnect },
    Ready(Arc<AppSession>),
}

pub struct SessionManager {
    apps: Arc<dyn AppDirectory>,
    connector: Arc<dyn AppConnector>,
    config: SessionConfig,
    events: EventBus,
    slots: Mutex<HashMap<SessionKey, Slot>>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(
        apps: Arc<dyn AppDirectory>,
        connector: Arc<dyn AppConnector>,
        config: SessionConfig,
        events: EventBus,
    ) -> Self {
        Self {
            apps,
            connector,
            config,
            events,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Return the pair's live session, connecting first if there is none
    pub async fn get_or_create(&self, agent_id: AgentId, app_id: AppId) -> Result<Arc<AppSession>, BusError> {
        let key = SessionKey::new(agent_id, app_id);
        let mut retired = Vec::new();

        let (generation, connect) = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(Slot::Ready(session)) if session.connection.is_alive() && !session.is_expired(self.config.ttl) => {
                    session.touch();
                    return Ok(session.clone());
                }
                Some(Slot::Pending { generation, connect }) => (*generation, connect.clone()),
                _ => {
                    if let Some(Slot::Ready(stale)) = slots.remove(&key) {
                        let reason = if stale.connection.is_alive() {
                            SessionCloseReason::Expired
                        } else {
                            SessionCloseReason::Broken
                        };
                        retired.push((stale, reason));
                    }
                    retired.extend(self.make_room(&mut slots, agent_id));

                    let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                    let connect = self.connect_future(key);
                    slots.insert(
                        key,
                        Slot::Pending {
                            generation,
                            connect: connect.clone(),
                        },
                    );
                    (generation, connect)
                }
            }
        };

        self.retire(retired).await;
        let result = connect.await;
        self.settle(key, generation, result).await
    }

    /// Discard `stale` (if it is still the pair's session) and connect afresh
    pub async fn replace_broken(&self, stale: &Arc<AppSession>) -> Result<Arc<AppSession>, BusError> {
        let key = stale.key;
        let removed = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(Slot::Ready(current)) if Arc::ptr_eq(current, stale) => slots.remove(&key),
                _ => None,
            }
        };
        if let Some(Slot::Ready(session)) = removed {
            debug!(session = %key, "Replacing broken session");
            self.retire(vec![(session, SessionCloseReason::Broken)]).await;
        }
        self.get_or_create(key.agent_id, key.app_id).await
    }

    /// Drop a session that failed and will not be retried
    pub async fn discard(&self, session: &Arc<AppSession>) {
        let removed = {
            let mut slots = self.slots.lock();
            match slots.get(&session.key) {
                Some(Slot::Ready(current)) if Arc::ptr_eq(current, session) => slots.remove(&session.key),
                _ => None,
            }
        };
        if let Some(Slot::Ready(session)) = removed {
            self.retire(vec![(session, SessionCloseReason::Broken)]).await;
        }
    }

    pub async fn invalidate(&self, agent_id: AgentId, app_id: AppId) -> Result<(), BusError> {
        let key = SessionKey::new(agent_id, app_id);
        let removed = self.slots.lock().remove(&key);
        match removed {
            Some(Slot::Ready(session)) => {
                self.retire(vec![(session, SessionCloseReason::Invalidated)]).await;
                Ok(())
            }
            Some(Slot::Pending { .. }) => Ok(()),
            None => Err(BusError::not_found(EntityKind::Session, key)),
        }
    }

    /// Tear down every agent's session with `app_id`; returns how many were live
    pub async fn invalidate_all_for_app(&self, app_id: AppId) -> usize {
        let removed = self.drain(|key, _| key.app_id == app_id);
        let count = removed.len();
        self.retire(removed.into_iter().map(|s| (s, SessionCloseReason::Invalidated)).collect())
            .await;
        if count > 0 {
            info!(app_id = %app_id, sessions = count, "Invalidated sessions for app");
        }
        count
    }

    /// Close sessions past their expiry or found dead; returns how many went
    pub async fn sweep_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let removed = self.drain(|_, session| session.is_expired(ttl) || !session.connection.is_alive());
        let count = removed.len();
        let retired = removed
            .into_iter()
            .map(|s| {
                let reason = if s.connection.is_alive() {
                    SessionCloseReason::Expired
                } else {
                    SessionCloseReason::Broken
                };
                (s, reason)
            })
            .collect();
        self.retire(retired).await;
        count
    }

    /// Snapshots of ready sessions, optionally for one agent, oldest first
    pub fn active_sessions(&self, agent_id: Option<AgentId>) -> Vec<SessionInfo> {
        let slots = self.slots.lock();
        let mut infos: Vec<SessionInfo> = slots
            .iter()
            .filter(|(key, _)| agent_id.is_none_or(|a| key.agent_id == a))
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(session) => Some(session.info(self.config.ttl)),
                Slot::Pending { .. } => None,
            })
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Close everything; used on shutdown
    pub async fn close_all(&self) -> usize {
        let removed = self.drain(|_, _| true);
        let count = removed.len();
        self.retire(removed.into_iter().map(|s| (s, SessionCloseReason::Shutdown)).collect())
            .await;
        self.slots.lock().clear();
        count
    }

    fn connect_future(&self, key: SessionKey) -> SharedConnect {
        let apps = self.apps.clone();
        let connector = self.connector.clone();
        let timeout = self.config.connect_timeout;

        async move {
            let app = apps.resolve(key.app_id).await?;
            let unavailable = |reason: String| BusError::SessionUnavailable {
                agent_id: key.agent_id,
                app_id: key.app_id,
                reason,
            };
            let connection = match tokio::time::timeout(timeout, connector.connect(&app, key.agent_id)).await {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => return Err(unavailable(e.to_string())),
                Err(_) => return Err(unavailable(format!("connect timed out after {:?}", timeout))),
            };
            Ok(Arc::new(AppSession::new(key, connection)))
        }
        .boxed()
        .shared()
    }

    /// Promote a finished connect into its slot, exactly once per generation
    async fn settle(&self, key: SessionKey, generation: u64, result: ConnectResult) -> ConnectResult {
        enum Outcome {
            Adopted,
            AlreadyAdopted,
            Orphaned,
        }

        let outcome = {
            let mut slots = self.slots.lock();
            let ours_pending = matches!(
                slots.get(&key),
                Some(Slot::Pending { generation: g, .. }) if *g == generation
            );
            match &result {
                Ok(session) if ours_pending => {
                    slots.insert(key, Slot::Ready(session.clone()));
                    Outcome::Adopted
                }
                Ok(session) => match slots.get(&key) {
                    Some(Slot::Ready(current)) if Arc::ptr_eq(current, session) => Outcome::AlreadyAdopted,
                    _ => Outcome::Orphaned,
                },
                Err(_) => {
                    if ours_pending {
                        slots.remove(&key);
                    }
                    Outcome::AlreadyAdopted
                }
            }
        };

        match (outcome, result) {
            (Outcome::Adopted, Ok(session)) => {
                counter!("agentbus_sessions_opened_total").increment(1);
                self.record_active();
                info!(agent_id = %key.agent_id, app_id = %key.app_id, session_id = %session.id, "Session opened");
                self.events.publish(BusEvent::SessionOpened { key, at: session.created_at });
                Ok(session)
            }
            (Outcome::Orphaned, Ok(session)) => {
                // Invalidated while connecting; never hand out an untracked connection
                self.close_bounded(&session).await;
                Err(BusError::SessionUnavailable {
                    agent_id: key.agent_id,
                    app_id: key.app_id,
                    reason: "session was invalidated while connecting".to_string(),
                })
            }
            (_, result) => result,
        }
    }

    /// Pick LRU ready sessions of `agent_id` to evict so one more fits
    fn make_room(&self, slots: &mut HashMap<SessionKey, Slot>, agent_id: AgentId) -> Vec<(Arc<AppSession>, SessionCloseReason)> {
        let cap = self.config.max_per_agent.max(1);
        let mut evicted = Vec::new();

        loop {
            let owned = slots.keys().filter(|k| k.agent_id == agent_id).count();
            if owned < cap {
                break;
            }
            let lru = slots
                .iter()
                .filter(|(k, _)| k.agent_id == agent_id)
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready(session) => Some((*k, session.idle_since())),
                    Slot::Pending { .. } => None,
                })
                .min_by_key(|(_, idle_since)| *idle_since)
                .map(|(k, _)| k);

            // Only in-flight connects left; let the cap overshoot briefly
            let Some(victim) = lru else { break };
            if let Some(Slot::Ready(session)) = slots.remove(&victim) {
                evicted.push((session, SessionCloseReason::Evicted));
            }
        }
        evicted
    }

    fn drain(&self, mut predicate: impl FnMut(&SessionKey, &AppSession) -> bool) -> Vec<Arc<AppSession>> {
        let mut slots = self.slots.lock();
        let doomed: Vec<SessionKey> = slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(session) if predicate(key, session) => Some(*key),
                _ => None,
            })
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| match slots.remove(&key) {
                Some(Slot::Ready(session)) => Some(session),
                _ => None,
            })
            .collect()
    }

    async fn retire(&self, sessions: Vec<(Arc<AppSession>, SessionCloseReason)>) {
        if sessions.is_empty() {
            return;
        }
        self.record_active();
        futures::future::join_all(sessions.iter().map(|(s, _)| self.close_bounded(s))).await;

        for (session, reason) in sessions {
            counter!("agentbus_sessions_closed_total", "reason" => reason.as_str()).increment(1);
            info!(
                agent_id = %session.key.agent_id,
                app_id = %session.key.app_id,
                session_id = %session.id,
                reason = reason.as_str(),
                "Session closed"
            );
            self.events.publish(BusEvent::SessionClosed {
                key: session.key,
                reason,
                at: Utc::now(),
            });
        }
    }

    /// Close a connection, giving up after `connect_timeout` so a hanging app
    /// cannot hold up callers waiting on other apps
    async fn close_bounded(&self, session: &AppSession) {
        let limit = self.config.connect_timeout;
        if tokio::time::timeout(limit, session.connection.close()).await.is_err() {
            warn!(
                agent_id = %session.key.agent_id,
                app_id = %session.key.app_id,
                session_id = %session.id,
                "Session close did not finish within {:?}; dropping connection",
                limit
            );
        }
    }

    fn record_active(&self) {
        let ready = self
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count();
        gauge!("agentbus_sessions_active").set(ready as f64);
    }
}

#[async_trait]
impl AppRemovalObserver for SessionManager {
    async fn app_removed(&self, app_id: AppId, _reason: AppRemovalReason) {
        self.invalidate_all_for_app(app_id).await;
    }

    async fn app_endpoint_changed(&self, app_id: AppId) {
        self.invalidate_all_for_app(app_id).await;
    }
}

pub struct SessionSweepJob {
    sessions: Arc<SessionManager>,
    period: Duration,
}

impl SessionSweepJob {
    pub fn new(sessions: Arc<SessionManager>, period: Duration) -> Self {
        Self { sessions, period }
    }
}

#[async_trait]
impl PeriodicJob for SessionSweepJob {
    fn name(&self) -> &'static str {
        "session-sweep"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let closed = self.sessions.sweep_expired().await;
        if closed > 0 {
            debug!(closed, "Swept expired sessions");
        }
        Ok(())
    }
}
