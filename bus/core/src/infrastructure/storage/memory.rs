// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Volatile Storage Backend
//!
//! Single in-process keyspace guarded by one `parking_lot::RwLock`. Keys are
//! typed on first write, the way a Redis keyspace is: a scalar key cannot be
//! used as a set and vice versa. Expiry is checked on every access and
//! expired entries are physically dropped by [`Storage::purge_expired`].

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::storage::{Storage, StorageError};

enum Value {
    Scalar(String),
    Set(BTreeSet<String>),
    List(Vec<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `key` if it has expired, so writers start from a clean slot
    fn evict_if_expired(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) {
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::Scalar(value) => Ok(Some(value.clone())),
                _ => Err(StorageError::WrongType(key.to_string())),
            },
            _ => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let removed = self.entries.write().remove(key);
        Ok(removed.is_some_and(|e| e.is_live(Instant::now())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        Self::evict_if_expired(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries.write();
        Self::evict_if_expired(&mut entries, key, Instant::now());
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(StorageError::WrongType(key.to_string())),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries.write();
        Self::evict_if_expired(&mut entries, key, Instant::now());
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        let (removed, now_empty) = match &mut entry.value {
            Value::Set(members) => (members.remove(member), members.is_empty()),
            _ => return Err(StorageError::WrongType(key.to_string())),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                _ => Err(StorageError::WrongType(key.to_string())),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::Set(members) => Ok(members.contains(member)),
                _ => Err(StorageError::WrongType(key.to_string())),
            },
            _ => Ok(false),
        }
    }

    async fn list_push(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        Self::evict_if_expired(&mut entries, key, now);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: None,
        });
        let len = match &mut entry.value {
            Value::List(items) => {
                items.push(value.to_string());
                items.len() as u64
            }
            _ => return Err(StorageError::WrongType(key.to_string())),
        };
        if let Some(ttl) = ttl {
            entry.expires_at = Some(now + ttl);
        }
        Ok(len)
    }

    async fn list_range(&self, key: &str, offset: usize, limit: Option<usize>) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::List(items) => Ok(items
                    .iter()
                    .skip(offset)
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()),
                _ => Err(StorageError::WrongType(key.to_string())),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn list_len(&self, key: &str) -> Result<u64, StorageError> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::List(items) => Ok(items.len() as u64),
                _ => Err(StorageError::WrongType(key.to_string())),
            },
            _ => Ok(0),
        }
    }

    async fn purge_expired(&self) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok((before - entries.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scalar_ttl_expiry() {
        let storage = MemoryStorage::new();
        storage.put("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(storage.get("k").await.unwrap(), None);
        assert!(!storage.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_extends_lifetime() {
        let storage = MemoryStorage::new();
        storage.put("k", "v", Some(Duration::from_millis(30))).await.unwrap();
        assert!(storage.expire("k", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(storage.get("k").await.unwrap().is_some());
        assert!(!storage.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_sets() {
        let storage = MemoryStorage::new();
        assert!(storage.set_add("s", "a").await.unwrap());
        assert!(!storage.set_add("s", "a").await.unwrap());
        assert!(storage.set_add("s", "b").await.unwrap());
        assert_eq!(storage.set_members("s").await.unwrap(), vec!["a", "b"]);
        assert!(storage.set_contains("s", "b").await.unwrap());

        assert!(storage.set_remove("s", "a").await.unwrap());
        assert!(storage.set_remove("s", "b").await.unwrap());
        assert!(storage.set_members("s").await.unwrap().is_empty());
        assert!(!storage.set_remove("s", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_lists_keep_insertion_order() {
        let storage = MemoryStorage::new();
        for (i, item) in ["first", "second", "third"].iter().enumerate() {
            let len = storage.list_push("l", item, None).await.unwrap();
            assert_eq!(len, i as u64 + 1);
        }
        assert_eq!(storage.list_range("l", 0, None).await.unwrap(), vec!["first", "second", "third"]);
        assert_eq!(storage.list_range("l", 1, Some(1)).await.unwrap(), vec!["second"]);
        assert_eq!(storage.list_len("l").await.unwrap(), 3);
        assert!(storage.list_range("missing", 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kinds_do_not_mix() {
        let storage = MemoryStorage::new();
        storage.put("k", "v", None).await.unwrap();
        assert!(matches!(storage.set_add("k", "m").await, Err(StorageError::WrongType(_))));
        assert!(matches!(storage.list_push("k", "m", None).await, Err(StorageError::WrongType(_))));

        storage.set_add("s", "m").await.unwrap();
        assert!(matches!(storage.get("s").await, Err(StorageError::WrongType(_))));

        // A plain write replaces whatever the key held
        storage.put("s", "scalar", None).await.unwrap();
        assert_eq!(storage.get("s").await.unwrap().as_deref(), Some("scalar"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let storage = MemoryStorage::new();
        storage.put("short", "v", Some(Duration::from_millis(10))).await.unwrap();
        storage.list_push("list", "v", Some(Duration::from_millis(10))).await.unwrap();
        storage.put("long", "v", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(storage.purge_expired().await.unwrap(), 2);
        assert_eq!(storage.get("long").await.unwrap().as_deref(), Some("v"));
    }
}
