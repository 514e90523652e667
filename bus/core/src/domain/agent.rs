// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Self-description an agent submits when registering.
///
/// `capabilities` and `metadata` are opaque to the bus and stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentManifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AgentManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            capabilities: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.name.trim().is_empty() {
            return Err(BusError::invalid_input("agent manifest name cannot be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(BusError::invalid_input(format!(
                "agent manifest '{}' has an empty version",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub manifest: AgentManifest,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(manifest: AgentManifest, now: DateTime<Utc>) -> Self {
        Self {
            id: AgentId::new(),
            manifest,
            registered_at: now,
            last_seen_at: now,
        }
    }

    /// Move `last_seen_at` forward; never backwards, never in place
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = advance(self.last_seen_at, now);
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_seen_at > ttl
    }
}

/// Strictly-increasing successor of `previous`, preferring `now`
pub(crate) fn advance(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + chrono::Duration::microseconds(1)
    }
}
