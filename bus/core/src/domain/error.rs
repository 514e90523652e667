// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Bus Error Taxonomy
//!
//! Every public operation of the core fails with a [`BusError`]. Registry and
//! task operations surface the specific kind directly; the proxy path adds a
//! coarse [`FailureOrigin`] so a calling agent can tell "the app is not
//! reachable" apart from "the tool rejected the call".
//!
//! Background loops never return these to callers; they log and continue.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::agent::AgentId;
use crate::domain::app::AppId;
use crate::domain::storage::StorageError;
use crate::domain::task::TaskState;

/// Kind of entity a lookup failed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agent,
    App,
    Task,
    Session,
    Message,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Agent => "agent",
            EntityKind::App => "app",
            EntityKind::Task => "task",
            EntityKind::Session => "session",
            EntityKind::Message => "message",
        };
        f.write_str(name)
    }
}

/// Coarse classification of a failure for the calling agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    /// The app could not be resolved, is unhealthy, or did not answer in time
    AppUnreachable,
    /// The app answered but refused the call
    ToolRejected,
    /// The request itself was wrong (unknown id, bad input, illegal transition)
    Caller,
    /// The bus itself is degraded
    Bus,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: EntityKind, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("app '{app_id}' is not healthy")]
    AppUnhealthy { app_id: AppId },

    #[error("no session available for agent '{agent_id}' on app '{app_id}': {reason}")]
    SessionUnavailable {
        agent_id: AgentId,
        app_id: AppId,
        reason: String,
    },

    #[error("tool '{tool}' not found on app '{app_id}'")]
    ToolNotFound { app_id: AppId, tool: String },

    #[error("tool '{tool}' on app '{app_id}' timed out after {timeout:?}")]
    UpstreamTimeout {
        app_id: AppId,
        tool: String,
        timeout: Duration,
    },

    #[error("app '{app_id}' failed the call: {message}")]
    UpstreamError { app_id: AppId, message: String },

    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Serializable error payload for a transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub origin: FailureOrigin,
    pub message: String,
}

impl BusError {
    pub fn not_found(entity: EntityKind, id: impl fmt::Display) -> Self {
        BusError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        BusError::InvalidInput(message.into())
    }

    /// Stable machine-readable kind; an unknown app reports `app_not_found`
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::NotFound {
                entity: EntityKind::App,
                ..
            } => "app_not_found",
            BusError::NotFound { .. } => "not_found",
            BusError::InvalidInput(_) => "invalid_input",
            BusError::AppUnhealthy { .. } => "app_unhealthy",
            BusError::SessionUnavailable { .. } => "session_unavailable",
            BusError::ToolNotFound { .. } => "tool_not_found",
            BusError::UpstreamTimeout { .. } => "upstream_timeout",
            BusError::UpstreamError { .. } => "upstream_error",
            BusError::InvalidTransition { .. } => "invalid_transition",
            BusError::StorageUnavailable(_) => "storage_unavailable",
        }
    }

    pub fn origin(&self) -> FailureOrigin {
        match self {
            BusError::NotFound {
                entity: EntityKind::App,
                ..
            }
            | BusError::AppUnhealthy { .. }
            | BusError::SessionUnavailable { .. }
            | BusError::UpstreamTimeout { .. } => FailureOrigin::AppUnreachable,
            BusError::ToolNotFound { .. } | BusError::UpstreamError { .. } => {
                FailureOrigin::ToolRejected
            }
            BusError::NotFound { .. }
            | BusError::InvalidInput(_)
            | BusError::InvalidTransition { .. } => FailureOrigin::Caller,
            BusError::StorageUnavailable(_) => FailureOrigin::Bus,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BusError::NotFound { .. })
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            origin: self.origin(),
            message: self.to_string(),
        }
    }
}

impl From<StorageError> for BusError {
    fn from(err: StorageError) -> Self {
        BusError::StorageUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_app_is_reported_as_unreachable() {
        let err = BusError::not_found(EntityKind::App, AppId::new());
        assert_eq!(err.kind(), "app_not_found");
        assert_eq!(err.origin(), FailureOrigin::AppUnreachable);

        let err = BusError::not_found(EntityKind::Task, "t-1");
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.origin(), FailureOrigin::Caller);
    }

    #[test]
    fn test_tool_failures_are_rejections() {
        let app_id = AppId::new();
        let missing = BusError::ToolNotFound {
            app_id,
            tool: "lookup".to_string(),
        };
        let failed = BusError::UpstreamError {
            app_id,
            message: "boom".to_string(),
        };
        assert_eq!(missing.origin(), FailureOrigin::ToolRejected);
        assert_eq!(failed.origin(), FailureOrigin::ToolRejected);

        let body = failed.to_body();
        assert_eq!(body.kind, "upstream_error");
        assert!(body.message.contains("boom"));
    }

    #[test]
    fn test_storage_errors_degrade_to_unavailable() {
        let err: BusError = StorageError::Unavailable("connection refused".to_string()).into();
        assert_eq!(err.kind(), "storage_unavailable");
        assert_eq!(err.origin(), FailureOrigin::Bus);
    }
}
