// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent Registry
//!
//! Heartbeat-driven membership. Agents register by manifest, renew by
//! resubmitting it (or by id), and silently disappear once `last_seen_at`
//! is older than the TTL.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Storage:** `agent:{id}` record, `agent-name:{len}:{name}@{version}` index,
//!   `agents` id set
//!
//! Operations on the same agent serialize through a per-key lock; the name
//! lock is always taken before the id lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tracing::{debug, info};

use crate::application::chrono_span;
use crate::application::scheduler::PeriodicJob;
use crate::domain::agent::{AgentId, AgentManifest, AgentRecord};
use crate::domain::error::{BusError, EntityKind};
use crate::domain::events::{AgentRemovalReason, BusEvent};
use crate::domain::storage::{read_json, write_json, Keyspace, Storage};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::keyed_lock::KeyedLocks;

pub struct AgentRegistry {
    storage: Arc<dyn Storage>,
    keys: Keyspace,
    ttl: Duration,
    locks: KeyedLocks<String>,
    events: EventBus,
}

impl AgentRegistry {
    pub fn new(storage: Arc<dyn Storage>, keys: Keyspace, ttl: Duration, events: EventBus) -> Self {
        Self {
            storage,
            keys,
            ttl,
            locks: KeyedLocks::new(),
            events,
        }
    }

    /// Register a manifest, or renew the record already holding its name+version
    pub async fn register(&self, manifest: AgentManifest) -> Result<AgentId, BusError> {
        manifest.validate()?;
        let name_key = self.keys.agent_name(&manifest.name, &manifest.version);
        let _name_guard = self.locks.lock(name_key.clone()).await;
        let now = Utc::now();

        if let Some(existing) = self.storage.get(&name_key).await? {
            if let Ok(id) = AgentId::from_string(&existing) {
                let record_key = self.keys.agent(id);
                let _id_guard = self.locks.lock(record_key.clone()).await;
                if let Some(mut record) = read_json::<AgentRecord>(self.storage.as_ref(), &record_key).await? {
                    record.manifest = manifest;
                    record.touch(now);
                    self.persist(&record).await?;

                    debug!(agent_id = %id, name = %record.manifest.name, "Agent renewed by resubmission");
                    self.events.publish(BusEvent::AgentRegistered {
                        agent_id: id,
                        name: record.manifest.name.clone(),
                        renewed: true,
                        at: record.last_seen_at,
                    });
                    return Ok(id);
                }
            }
        }

        let record = AgentRecord::new(manifest, now);
        self.persist(&record).await?;
        self.storage.set_add(&self.keys.agents(), &record.id.to_string()).await?;

        counter!("agentbus_agents_registered_total").increment(1);
        info!(
            agent_id = %record.id,
            name = %record.manifest.name,
            version = %record.manifest.version,
            "Agent registered"
        );
        self.events.publish(BusEvent::AgentRegistered {
            agent_id: record.id,
            name: record.manifest.name.clone(),
            renewed: false,
            at: now,
        });
        Ok(record.id)
    }

    /// Heartbeat: move `last_seen_at` forward
    pub async fn renew(&self, id: AgentId) -> Result<AgentRecord, BusError> {
        let record_key = self.keys.agent(id);
        let _guard = self.locks.lock(record_key.clone()).await;
        let mut record = self.load(&record_key, id).await?;
        record.touch(Utc::now());
        self.persist(&record).await?;
        debug!(agent_id = %id, "Agent heartbeat");
        Ok(record)
    }

    pub async fn get(&self, id: AgentId) -> Result<AgentRecord, BusError> {
        self.load(&self.keys.agent(id), id).await
    }

    /// Live agents, oldest registration first
    pub async fn list(&self) -> Result<Vec<AgentRecord>, BusError> {
        let now = Utc::now();
        let ttl = chrono_span(self.ttl);
        let set_key = self.keys.agents();
        let mut records = Vec::new();

        for member in self.storage.set_members(&set_key).await? {
            match read_json::<AgentRecord>(self.storage.as_ref(), &self.keys.agent(&member)).await? {
                Some(record) if !record.is_stale(now, ttl) => records.push(record),
                Some(_) => {}
                None => {
                    self.storage.set_remove(&set_key, &member).await?;
                }
            }
        }
        records.sort_by_key(|r| r.registered_at);
        Ok(records)
    }

    pub async fn remove(&self, id: AgentId) -> Result<(), BusError> {
        let record_key = self.keys.agent(id);
        let _guard = self.locks.lock(record_key.clone()).await;
        let record = self.load(&record_key, id).await?;
        self.purge(&record).await?;

        info!(agent_id = %id, "Agent unregistered");
        self.events.publish(BusEvent::AgentRemoved {
            agent_id: id,
            reason: AgentRemovalReason::Unregistered,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Evict every agent not seen within the TTL; returns how many went
    pub async fn sweep_expired(&self) -> Result<usize, BusError> {
        let ttl = chrono_span(self.ttl);
        let set_key = self.keys.agents();
        let mut evicted = 0;

        for member in self.storage.set_members(&set_key).await? {
            let Ok(id) = AgentId::from_string(&member) else {
                self.storage.set_remove(&set_key, &member).await?;
                continue;
            };
            let record_key = self.keys.agent(id);
            let _guard = self.locks.lock(record_key.clone()).await;

            // Read under the lock so a renewal that got there first wins
            let stale = match read_json::<AgentRecord>(self.storage.as_ref(), &record_key).await? {
                Some(record) if record.is_stale(Utc::now(), ttl) => {
                    self.purge(&record).await?;
                    true
                }
                Some(_) => false,
                None => {
                    self.storage.set_remove(&set_key, &member).await?;
                    true
                }
            };

            if stale {
                evicted += 1;
                counter!("agentbus_agents_evicted_total").increment(1);
                info!(agent_id = %id, "Agent expired");
                self.events.publish(BusEvent::AgentRemoved {
                    agent_id: id,
                    reason: AgentRemovalReason::Expired,
                    at: Utc::now(),
                });
            }
        }
        Ok(evicted)
    }

    async fn load(&self, record_key: &str, id: AgentId) -> Result<AgentRecord, BusError> {
        read_json(self.storage.as_ref(), record_key)
            .await?
            .ok_or_else(|| BusError::not_found(EntityKind::Agent, id))
    }

    async fn persist(&self, record: &AgentRecord) -> Result<(), BusError> {
        let ttl = Some(self.ttl);
        write_json(self.storage.as_ref(), &self.keys.agent(record.id), record, ttl).await?;
        let name_key = self.keys.agent_name(&record.manifest.name, &record.manifest.version);
        self.storage.put(&name_key, &record.id.to_string(), ttl).await?;
        Ok(())
    }

    async fn purge(&self, record: &AgentRecord) -> Result<(), BusError> {
        let id = record.id.to_string();
        self.storage.delete(&self.keys.agent(&id)).await?;
        let name_key = self.keys.agent_name(&record.manifest.name, &record.manifest.version);
        if self.storage.get(&name_key).await?.as_deref() == Some(id.as_str()) {
            self.storage.delete(&name_key).await?;
        }
        self.storage.set_remove(&self.keys.agents(), &id).await?;
        Ok(())
    }
}

pub struct AgentSweepJob {
    registry: Arc<AgentRegistry>,
    period: Duration,
}

impl AgentSweepJob {
    pub fn new(registry: Arc<AgentRegistry>, period: Duration) -> Self {
        Self { registry, period }
    }
}

#[async_trait]
impl PeriodicJob for AgentSweepJob {
    fn name(&self) -> &'static str {
        "agent-sweep"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.registry.sweep_expired().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::MemoryStorage;

    fn registry(ttl: Duration) -> AgentRegistry {
        AgentRegistry::new(
            Arc::new(MemoryStorage::new()),
            Keyspace::default(),
            ttl,
            EventBus::new(16),
        )
    }

    #[tokio::test]
    async fn test_resubmission_renews_instead_of_duplicating() {
        let registry = registry(Duration::from_secs(60));
        let id = registry.register(AgentManifest::new("planner", "1.0")).await.unwrap();
        let first_seen = registry.get(id).await.unwrap().last_seen_at;

        let again = registry.register(AgentManifest::new("planner", "1.0")).await.unwrap();
        assert_eq!(again, id);

        let agents = registry.list().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].last_seen_at > first_seen);

        let other = registry.register(AgentManifest::new("planner", "2.0")).await.unwrap();
        assert_ne!(other, id);
        assert_eq!(registry.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_separator_in_name_or_version_keeps_agents_apart() {
        let registry = registry(Duration::from_secs(60));
        let first = registry.register(AgentManifest::new("a@b", "c")).await.unwrap();
        let second = registry.register(AgentManifest::new("a", "b@c")).await.unwrap();
        assert_ne!(first, second);

        let mut names: Vec<_> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.manifest.name, a.manifest.version))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), "b@c".to_string()),
                ("a@b".to_string(), "c".to_string()),
            ]
        );
        assert_eq!(registry.get(first).await.unwrap().manifest.name, "a@b");
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let registry = registry(Duration::from_secs(60));
        let missing = AgentId::new();
        assert!(registry.renew(missing).await.unwrap_err().is_not_found());
        assert!(registry.remove(missing).await.unwrap_err().is_not_found());
        assert!(registry.get(missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_rejected() {
        let registry = registry(Duration::from_secs(60));
        let err = registry.register(AgentManifest::new("", "1.0")).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_remove_frees_the_name() {
        let registry = registry(Duration::from_secs(60));
        let id = registry.register(AgentManifest::new("coder", "1")).await.unwrap();
        registry.remove(id).await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());

        let fresh = registry.register(AgentManifest::new("coder", "1")).await.unwrap();
        assert_ne!(fresh, id);
    }

    #[tokio::test]
    async fn test_sweep_evicts_silent_agents_only() {
        let registry = registry(Duration::from_millis(60));
        let quiet = registry.register(AgentManifest::new("quiet", "1")).await.unwrap();
        let chatty = registry.register(AgentManifest::new("chatty", "1")).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            registry.renew(chatty).await.unwrap();
        }

        let evicted = registry.sweep_expired().await.unwrap();
        assert_eq!(evicted, 1);
        let ids: Vec<_> = registry.list().await.unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![chatty]);
        assert!(registry.renew(quiet).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_removal_is_published() {
        let events = EventBus::new(16);
        let registry = AgentRegistry::new(
            Arc::new(MemoryStorage::new()),
            Keyspace::default(),
            Duration::from_secs(60),
            events.clone(),
        );
        let id = registry.register(AgentManifest::new("a", "1")).await.unwrap();
        let mut receiver = events.subscribe_agent(id);
        registry.remove(id).await.unwrap();

        match receiver.recv().await.unwrap() {
            BusEvent::AgentRemoved { reason, .. } => assert_eq!(reason, AgentRemovalReason::Unregistered),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
