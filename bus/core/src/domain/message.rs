// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Message
//!
//! Immutable messages exchanged between agents and recorded in task
//! histories. Content is an ordered list of [`Part`]s; each part carries
//! exactly one payload kind, enforced by the enum itself.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Message value objects and inbox envelope

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::error::BusError;
use crate::domain::task::{ContextId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The party that asked for the work
    User,
    /// The agent doing the work
    Agent,
}

/// Where a file's content lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    Uri(String),
    /// Base64-encoded inline content
    Bytes(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub source: FileSource,
}

/// One unit of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Map<String, Value>>,
    },
    File {
        file: FileContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Map<String, Value>>,
    },
    Data {
        data: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Map<String, Value>>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            metadata: None,
        }
    }

    pub fn data(data: Map<String, Value>) -> Self {
        Part::Data { data, metadata: None }
    }

    pub fn file(file: FileContent) -> Self {
        Part::File { file, metadata: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_task_ids: Vec<TaskId>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            message_id: MessageId::new(),
            context_id: None,
            task_id: None,
            role,
            parts,
            metadata: None,
            reference_task_ids: Vec::new(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::new(Role::Agent, vec![Part::text(text)])
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.parts.is_empty() {
            return Err(BusError::invalid_input(format!(
                "message '{}' has no parts",
                self.message_id
            )));
        }
        Ok(())
    }
}

/// A message sitting in an agent's inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent_id: Option<AgentId>,
    pub to_agent_id: AgentId,
    pub message: Message,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_is_tagged_by_kind() {
        let part = Part::text("hello");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "hello");

        let file = Part::file(FileContent {
            name: Some("report.pdf".to_string()),
            media_type: Some("application/pdf".to_string()),
            source: FileSource::Uri("s3://bucket/report.pdf".to_string()),
        });
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["kind"], "file");
        assert_eq!(json["file"]["source"]["uri"], "s3://bucket/report.pdf");

        let parsed: Part = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, file);
    }

    #[test]
    fn test_part_with_unknown_kind_is_rejected() {
        let raw = serde_json::json!({"kind": "video", "url": "x"});
        assert!(serde_json::from_value::<Part>(raw).is_err());
    }

    #[test]
    fn test_empty_message_is_invalid() {
        let message = Message::new(Role::User, vec![]);
        assert!(matches!(message.validate(), Err(BusError::InvalidInput(_))));
        assert!(Message::user_text("hi").validate().is_ok());
    }
}
