// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent-app session value objects.
//!
//! The live session itself ([`crate::application::session_manager::AppSession`])
//! never leaves the session manager; callers only see these snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::app::AppId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One session per (agent, app) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub agent_id: AgentId,
    pub app_id: AppId,
}

impl SessionKey {
    pub fn new(agent_id: AgentId, app_id: AppId) -> Self {
        Self { agent_id, app_id }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.app_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCloseReason {
    Expired,
    /// Torn down to make room under the per-agent cap
    Evicted,
    Invalidated,
    /// Connection found dead on use
    Broken,
    Shutdown,
}

impl SessionCloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionCloseReason::Expired => "expired",
            SessionCloseReason::Evicted => "evicted",
            SessionCloseReason::Invalidated => "invalidated",
            SessionCloseReason::Broken => "broken",
            SessionCloseReason::Shutdown => "shutdown",
        }
    }
}
