// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain events published on the in-process event bus.
//!
//! Events are observations only; no component depends on receiving them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::AgentId;
use crate::domain::app::{AppId, AppRemovalReason};
use crate::domain::message::MessageId;
use crate::domain::session::{SessionCloseReason, SessionKey};
use crate::domain::task::{ContextId, TaskId, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRemovalReason {
    Unregistered,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    AgentRegistered {
        agent_id: AgentId,
        name: String,
        renewed: bool,
        at: DateTime<Utc>,
    },
    AgentRemoved {
        agent_id: AgentId,
        reason: AgentRemovalReason,
        at: DateTime<Utc>,
    },
    AppRegistered {
        app_id: AppId,
        name: String,
        renewed: bool,
        at: DateTime<Utc>,
    },
    AppHealthChanged {
        app_id: AppId,
        healthy: bool,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },
    AppRemoved {
        app_id: AppId,
        reason: AppRemovalReason,
        at: DateTime<Utc>,
    },
    SessionOpened {
        key: SessionKey,
        at: DateTime<Utc>,
    },
    SessionClosed {
        key: SessionKey,
        reason: SessionCloseReason,
        at: DateTime<Utc>,
    },
    TaskStatusChanged {
        task_id: TaskId,
        context_id: ContextId,
        from: TaskState,
        to: TaskState,
        at: DateTime<Utc>,
    },
    MessageDelivered {
        message_id: MessageId,
        to_agent_id: AgentId,
        at: DateTime<Utc>,
    },
}

impl BusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BusEvent::AgentRegistered { .. } => "agent_registered",
            BusEvent::AgentRemoved { .. } => "agent_removed",
            BusEvent::AppRegistered { .. } => "app_registered",
            BusEvent::AppHealthChanged { .. } => "app_health_changed",
            BusEvent::AppRemoved { .. } => "app_removed",
            BusEvent::SessionOpened { .. } => "session_opened",
            BusEvent::SessionClosed { .. } => "session_closed",
            BusEvent::TaskStatusChanged { .. } => "task_status_changed",
            BusEvent::MessageDelivered { .. } => "message_delivered",
        }
    }
}
