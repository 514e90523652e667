// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Storage Interface
//!
//! The single shared mutable substrate of the bus. One keyspace of string
//! keys, each holding a scalar value, a set of strings, or an ordered list of
//! strings. Scalars and lists may carry a TTL; expired keys are invisible to
//! every read.
//!
//! | Implementation | Module |
//! |----------------|--------|
//! | `MemoryStorage` | `crate::infrastructure::storage::memory` |
//! | `PostgresStorage` | `crate::infrastructure::storage::postgres` |
//!
//! Callers treat the store as transactional only per key; no multi-key
//! atomicity is assumed.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a scalar value
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a scalar value, replacing whatever the key held
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Delete a key of any kind; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Reset the TTL of a scalar or list key; returns whether it existed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Add a member to a set; returns whether it was newly added
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    /// Remove a member from a set; returns whether it was present
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    /// Append to the tail of a list, refreshing the whole list's TTL when one
    /// is given; returns the new length
    async fn list_push(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StorageError>;

    /// Read `limit` items (all when `None`) starting at `offset`, in insertion order
    async fn list_range(&self, key: &str, offset: usize, limit: Option<usize>) -> Result<Vec<String>, StorageError>;

    async fn list_len(&self, key: &str) -> Result<u64, StorageError>;

    /// Physically drop expired keys; returns how many were removed
    async fn purge_expired(&self) -> Result<u64, StorageError>;

    /// Check backend connectivity
    async fn ping(&self) -> Result<(), StorageError>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key '{0}' holds a value of another kind")]
    WrongType(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Read and deserialize a JSON record
pub async fn read_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON record
pub async fn write_json<T: Serialize + Sync>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    storage.put(key, &raw, ttl).await
}

/// Key layout shared by every component, under one configurable prefix
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, suffix: impl std::fmt::Display) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    pub fn agent(&self, id: impl std::fmt::Display) -> String {
        self.key(format_args!("agent:{}", id))
    }

    /// Name index for an agent manifest. The name is length-prefixed so a
    /// name or version containing `@` cannot collide with another pair.
    pub fn agent_name(&self, name: &str, version: &str) -> String {
        self.key(format_args!("agent-name:{}:{}@{}", name.len(), name, version))
    }

    pub fn agents(&self) -> String {
        self.key("agents")
    }

    pub fn app(&self, id: impl std::fmt::Display) -> String {
        self.key(format_args!("app:{}", id))
    }

    pub fn app_name(&self, name: &str) -> String {
        self.key(format_args!("app-name:{}", name))
    }

    pub fn apps(&self) -> String {
        self.key("apps")
    }

    pub fn task(&self, id: impl std::fmt::Display) -> String {
        self.key(format_args!("task:{}", id))
    }

    pub fn task_history(&self, id: impl std::fmt::Display) -> String {
        self.key(format_args!("task:{}:history", id))
    }

    pub fn tasks(&self) -> String {
        self.key("tasks")
    }

    pub fn tasks_by_context(&self, context_id: impl std::fmt::Display) -> String {
        self.key(format_args!("tasks:context:{}", context_id))
    }

    pub fn tasks_by_state(&self, state: impl std::fmt::Display) -> String {
        self.key(format_args!("tasks:state:{}", state))
    }

    pub fn message(&self, id: impl std::fmt::Display) -> String {
        self.key(format_args!("message:{}", id))
    }

    pub fn inbox(&self, agent_id: impl std::fmt::Display) -> String {
        self.key(format_args!("inbox:{}", agent_id))
    }

    pub fn inbox_unread(&self, agent_id: impl std::fmt::Display) -> String {
        self.key(format_args!("inbox:{}:unread", agent_id))
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("agentbus:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_layout() {
        let keys = Keyspace::new("t:");
        assert_eq!(keys.agents(), "t:agents");
        assert_eq!(keys.agent_name("planner", "1.0"), "t:agent-name:7:planner@1.0");
        assert_eq!(keys.task_history("abc"), "t:task:abc:history");
        assert_eq!(keys.tasks_by_state("working"), "t:tasks:state:working");
        assert_eq!(keys.inbox_unread("a1"), "t:inbox:a1:unread");
    }

    #[test]
    fn test_agent_name_keys_do_not_collide_on_separator() {
        let keys = Keyspace::new("t:");
        assert_ne!(keys.agent_name("a@b", "c"), keys.agent_name("a", "b@c"));
        assert_ne!(keys.agent_name("a:1", "x"), keys.agent_name("a", "1:x"));
    }
}
