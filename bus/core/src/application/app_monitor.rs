// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! App Health Monitor
//!
//! Active-polling membership for apps. Every registered app gets its own
//! probe loop, so a slow or hanging health endpoint only ever delays itself.
//! A probe result is applied under the app's lock in completion order.
//!
//! When `consecutive_failures` reaches the threshold the app is deleted
//! outright (record, name index, set membership), its loop is cancelled and
//! every [`AppRemovalObserver`] is told before the lock is released, so the
//! next proxied call fails fast with NotFound instead of reusing a dead
//! session.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Storage:** `app:{id}` record, `app-name:{name}` index, `apps` id set
//! - **Collaborators:** [`HealthProbe`] for polling, observers held weakly

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::app::{AppCard, AppDirectory, AppId, AppRecord, AppRemovalObserver, AppRemovalReason};
use crate::domain::bus_config::AppMonitorConfig;
use crate::domain::error::{BusError, EntityKind};
use crate::domain::events::BusEvent;
use crate::domain::health::{HealthProbe, ProbeOutcome};
use crate::domain::storage::{read_json, write_json, Keyspace, Storage};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::keyed_lock::KeyedLocks;

/// Grace added on top of the probe's own timeout before the monitor gives up on it
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// What applying one probe did to an app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Failing { consecutive_failures: u32 },
    Removed,
}

pub struct AppHealthMonitor {
    storage: Arc<dyn Storage>,
    keys: Keyspace,
    config: AppMonitorConfig,
    probe: Arc<dyn HealthProbe>,
    events: EventBus,
    locks: KeyedLocks<String>,
    loops: DashMap<AppId, CancellationToken>,
    observers: RwLock<Vec<Weak<dyn AppRemovalObserver>>>,
    shutdown: CancellationToken,
    this: Weak<Self>,
}

impl AppHealthMonitor {
    pub fn new(
        storage: Arc<dyn Storage>,
        keys: Keyspace,
        config: AppMonitorConfig,
        probe: Arc<dyn HealthProbe>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            storage,
            keys,
            config,
            probe,
            events,
            locks: KeyedLocks::new(),
            loops: DashMap::new(),
            observers: RwLock::new(Vec::new()),
            shutdown,
            this: this.clone(),
        })
    }

    pub fn add_observer(&self, observer: Weak<dyn AppRemovalObserver>) {
        self.observers.write().push(observer);
    }

    /// Drop apps persisted by a previous process; they must re-register
    pub async fn discard_persisted(&self) -> Result<usize, BusError> {
        let set_key = self.keys.apps();
        let members = self.storage.set_members(&set_key).await?;
        for member in &members {
            let record_key = self.keys.app(member);
            if let Some(record) = read_json::<AppRecord>(self.storage.as_ref(), &record_key).await? {
                self.storage.delete(&self.keys.app_name(&record.card.name)).await?;
            }
            self.storage.delete(&record_key).await?;
            self.storage.set_remove(&set_key, member).await?;
        }
        if !members.is_empty() {
            info!(count = members.len(), "Discarded apps persisted by a previous run");
        }
        Ok(members.len())
    }

    /// Register a card, or renew the app already registered under its name
    pub async fn register(&self, card: AppCard) -> Result<AppId, BusError> {
        card.validate()?;
        let name_key = self.keys.app_name(&card.name);
        let _name_guard = self.locks.lock(name_key.clone()).await;
        let now = Utc::now();

        if let Some(existing) = self.storage.get(&name_key).await? {
            if let Ok(id) = AppId::from_string(&existing) {
                let record_key = self.keys.app(id);
                let _id_guard = self.locks.lock(record_key.clone()).await;
                if let Some(mut record) = read_json::<AppRecord>(self.storage.as_ref(), &record_key).await? {
                    let endpoint_changed = record.card.mcp_endpoint != card.mcp_endpoint;
                    record.renew(card, now);
                    write_json(self.storage.as_ref(), &record_key, &record, None).await?;

                    debug!(app_id = %id, name = %record.card.name, "App renewed by resubmission");
                    if endpoint_changed {
                        self.notify_endpoint_changed(id).await;
                    }
                    self.ensure_probe_loop(id);
                    self.events.publish(BusEvent::AppRegistered {
                        app_id: id,
                        name: record.card.name,
                        renewed: true,
                        at: now,
                    });
                    return Ok(id);
                }
            }
        }

        let record = AppRecord::new(card, now);
        write_json(self.storage.as_ref(), &self.keys.app(record.id), &record, None).await?;
        self.storage.put(&name_key, &record.id.to_string(), None).await?;
        self.storage.set_add(&self.keys.apps(), &record.id.to_string()).await?;
        self.ensure_probe_loop(record.id);

        info!(
            app_id = %record.id,
            name = %record.card.name,
            health_check_url = %record.card.health_check_url,
            "App registered"
        );
        self.events.publish(BusEvent::AppRegistered {
            app_id: record.id,
            name: record.card.name.clone(),
            renewed: false,
            at: now,
        });
        Ok(record.id)
    }

    /// Replace an app's card; like a renewal, health tracking starts afresh
    pub async fn update(&self, id: AppId, card: AppCard) -> Result<AppRecord, BusError> {
        card.validate()?;
        let new_name_key = self.keys.app_name(&card.name);
        let _name_guard = self.locks.lock(new_name_key.clone()).await;
        let record_key = self.keys.app(id);
        let _id_guard = self.locks.lock(record_key.clone()).await;

        let mut record = self.load(&record_key, id).await?;
        if record.card.name != card.name {
            if let Some(holder) = self.storage.get(&new_name_key).await? {
                if holder != id.to_string() {
                    return Err(BusError::invalid_input(format!(
                        "app name '{}' is already registered",
                        card.name
                    )));
                }
            }
            self.storage.delete(&self.keys.app_name(&record.card.name)).await?;
            self.storage.put(&new_name_key, &id.to_string(), None).await?;
        }

        let endpoint_changed = record.card.mcp_endpoint != card.mcp_endpoint;
        record.renew(card, Utc::now());
        write_json(self.storage.as_ref(), &record_key, &record, None).await?;
        if endpoint_changed {
            self.notify_endpoint_changed(id).await;
        }
        info!(app_id = %id, "App card updated");
        Ok(record)
    }

    pub async fn get(&self, id: AppId) -> Result<AppRecord, BusError> {
        self.load(&self.keys.app(id), id).await
    }

    pub async fn find_by_name(&self, name: &str) -> Result<AppRecord, BusError> {
        let not_found = || BusError::not_found(EntityKind::App, name);
        let id = self
            .storage
            .get(&self.keys.app_name(name))
            .await?
            .and_then(|raw| AppId::from_string(&raw).ok())
            .ok_or_else(not_found)?;
        read_json(self.storage.as_ref(), &self.keys.app(id))
            .await?
            .ok_or_else(not_found)
    }

    /// Registered apps by registration time; `healthy_only` hides failing ones
    pub async fn list(&self, healthy_only: bool) -> Result<Vec<AppRecord>, BusError> {
        let set_key = self.keys.apps();
        let mut records = Vec::new();
        for member in self.storage.set_members(&set_key).await? {
            match read_json::<AppRecord>(self.storage.as_ref(), &self.keys.app(&member)).await? {
                Some(record) if !healthy_only || record.healthy => records.push(record),
                Some(_) => {}
                None => {
                    self.storage.set_remove(&set_key, &member).await?;
                }
            }
        }
        records.sort_by_key(|r| r.registered_at);
        Ok(records)
    }

    pub async fn remove(&self, id: AppId) -> Result<(), BusError> {
        let record_key = self.keys.app(id);
        let _guard = self.locks.lock(record_key.clone()).await;
        let record = self.load(&record_key, id).await?;
        self.remove_locked(&record, AppRemovalReason::Unregistered).await
    }

    /// Probe an app once and apply the outcome
    pub async fn probe_now(&self, id: AppId) -> Result<HealthVerdict, BusError> {
        let record = self.get(id).await?;
        let timeout = self.config.health_check_timeout;
        let outcome = tokio::time::timeout(
            timeout + PROBE_GRACE,
            self.probe.probe(&record.card.health_check_url, timeout),
        )
        .await
        .unwrap_or(ProbeOutcome::TimedOut);

        counter!("agentbus_app_probes_total", "outcome" => outcome.label()).increment(1);
        self.apply_probe(id, &outcome).await
    }

    /// Stop every probe loop
    pub fn shutdown(&self) {
        for entry in self.loops.iter() {
            entry.value().cancel();
        }
        self.loops.clear();
    }

    /// Number of probe loops currently running
    pub fn probing(&self) -> usize {
        self.loops.len()
    }

    async fn apply_probe(&self, id: AppId, outcome: &ProbeOutcome) -> Result<HealthVerdict, BusError> {
        let record_key = self.keys.app(id);
        let _guard = self.locks.lock(record_key.clone()).await;
        // The app may have been removed while the probe was in flight
        let mut record = self.load(&record_key, id).await?;
        let now = Utc::now();

        if outcome.is_healthy() {
            let recovered = !record.healthy;
            record.record_success(now);
            write_json(self.storage.as_ref(), &record_key, &record, None).await?;
            if recovered {
                info!(app_id = %id, "App healthy again");
                self.events.publish(BusEvent::AppHealthChanged {
                    app_id: id,
                    healthy: true,
                    consecutive_failures: 0,
                    at: now,
                });
            }
            return Ok(HealthVerdict::Healthy);
        }

        let failures = record.record_failure();
        warn!(
            app_id = %id,
            outcome = outcome.label(),
            consecutive_failures = failures,
            threshold = self.config.unhealthy_threshold,
            "App health check failed"
        );

        if failures >= self.config.unhealthy_threshold {
            self.remove_locked(&record, AppRemovalReason::Unhealthy).await?;
            return Ok(HealthVerdict::Removed);
        }

        write_json(self.storage.as_ref(), &record_key, &record, None).await?;
        self.events.publish(BusEvent::AppHealthChanged {
            app_id: id,
            healthy: false,
            consecutive_failures: failures,
            at: now,
        });
        Ok(HealthVerdict::Failing {
            consecutive_failures: failures,
        })
    }

    /// Delete every trace of the app; caller holds the app's lock
    async fn remove_locked(&self, record: &AppRecord, reason: AppRemovalReason) -> Result<(), BusError> {
        let id = record.id;
        self.storage.delete(&self.keys.app(id)).await?;
        let name_key = self.keys.app_name(&record.card.name);
        if self.storage.get(&name_key).await?.as_deref() == Some(id.to_string().as_str()) {
            self.storage.delete(&name_key).await?;
        }
        self.storage.set_remove(&self.keys.apps(), &id.to_string()).await?;

        if let Some((_, token)) = self.loops.remove(&id) {
            token.cancel();
        }

        counter!("agentbus_apps_removed_total", "reason" => reason.as_str()).increment(1);
        info!(app_id = %id, name = %record.card.name, reason = reason.as_str(), "App removed");

        for observer in self.live_observers() {
            observer.app_removed(id, reason).await;
        }
        self.events.publish(BusEvent::AppRemoved {
            app_id: id,
            reason,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn notify_endpoint_changed(&self, id: AppId) {
        info!(app_id = %id, "App endpoint changed; dropping its sessions");
        for observer in self.live_observers() {
            observer.app_endpoint_changed(id).await;
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn AppRemovalObserver>> {
        let mut observers = self.observers.write();
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    fn ensure_probe_loop(&self, id: AppId) {
        if self.shutdown.is_cancelled() || self.loops.contains_key(&id) {
            return;
        }
        let token = self.shutdown.child_token();
        self.loops.insert(id, token.clone());

        let monitor = self.this.clone();
        let period = self.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        match monitor.probe_now(id).await {
                            Ok(HealthVerdict::Removed) => break,
                            Ok(_) => {}
                            Err(e) if e.is_not_found() => {
                                monitor.loops.remove(&id);
                                break;
                            }
                            Err(e) => warn!(app_id = %id, error = %e, "Applying health probe failed"),
                        }
                    }
                }
            }
            debug!(app_id = %id, "Probe loop stopped");
        });
    }

    async fn load(&self, record_key: &str, id: AppId) -> Result<AppRecord, BusError> {
        read_json(self.storage.as_ref(), record_key)
            .await?
            .ok_or_else(|| BusError::not_found(EntityKind::App, id))
    }
}

#[async_trait]
impl AppDirectory for AppHealthMonitor {
    async fn resolve(&self, app_id: AppId) -> Result<AppRecord, BusError> {
        self.get(app_id).await
    }
}
