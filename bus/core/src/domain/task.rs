// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Task
//!
//! Trackable units of work with a validated status lifecycle and an
//! append-only message history.
//!
//! ```text
//! submitted ──► working ──► completed | failed | cancelled | rejected
//!                 ▲   │
//!                 │   ▼
//!        input_required | auth_required
//! ```
//!
//! `cancel` short-circuits from any non-terminal state to `cancelled`.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Task aggregate and its state machine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::error::BusError;
use crate::domain::message::{Message, Part};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Groups related tasks and messages; caller-chosen or generated
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    AuthRequired,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Submitted,
        TaskState::Working,
        TaskState::InputRequired,
        TaskState::AuthRequired,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
        TaskState::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input_required",
            TaskState::AuthRequired => "auth_required",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::Rejected
        )
    }

    /// Edges reachable through an ordinary status update
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Submitted, Working) => true,
            (Working, Completed | Failed | Cancelled | Rejected | InputRequired | AuthRequired) => true,
            (InputRequired | AuthRequired, Working) => true,
            _ => false,
        }
    }

    pub fn ensure_transition(&self, next: TaskState) -> Result<(), BusError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(BusError::InvalidTransition { from: *self, to: next })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| BusError::invalid_input(format!("unknown task state '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Artifact {
    pub fn new(parts: Vec<Part>) -> Self {
        Self {
            artifact_id: Uuid::new_v4().to_string(),
            name: None,
            description: None,
            parts,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub context_id: ContextId,
    pub status: TaskStatus,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Loaded from the history list on read; never persisted inline
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(context_id: ContextId, metadata: Map<String, Value>, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            context_id,
            status: TaskStatus {
                state: TaskState::Submitted,
                message: None,
                timestamp: now,
            },
            artifacts: Vec::new(),
            history: Vec::new(),
            metadata,
            created_at: now,
        }
    }

    pub fn state(&self) -> TaskState {
        self.status.state
    }

    /// Apply a validated status update
    pub fn transition(
        &mut self,
        next: TaskState,
        message: Option<Message>,
        now: DateTime<Utc>,
    ) -> Result<TaskState, BusError> {
        self.status.state.ensure_transition(next)?;
        Ok(self.set_status(next, message, now))
    }

    /// Move to `cancelled` from any non-terminal state
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<TaskState, BusError> {
        if self.status.state.is_terminal() {
            return Err(BusError::InvalidTransition {
                from: self.status.state,
                to: TaskState::Cancelled,
            });
        }
        Ok(self.set_status(TaskState::Cancelled, None, now))
    }

    fn set_status(&mut self, next: TaskState, message: Option<Message>, now: DateTime<Utc>) -> TaskState {
        let previous = self.status.state;
        self.status = TaskStatus {
            state: next,
            message,
            timestamp: now,
        };
        previous
    }

    /// Stamp a message with this task's identity before it enters history
    pub fn adopt(&self, mut message: Message) -> Message {
        message.task_id = Some(self.id);
        message.context_id = Some(self.context_id.clone());
        message
    }
}

/// Listing filter; both criteria are optional and combine with AND
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
    pub context_id: Option<ContextId>,
    pub state: Option<TaskState>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub context_id: Option<ContextId>,
    pub initial_message: Option<Message>,
    pub metadata: Map<String, Value>,
}
