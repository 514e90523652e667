// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Service Bus
//!
//! Composition root. [`ServiceBusBuilder`] turns a [`BusConfigManifest`]
//! into a wired [`ServiceBus`]; collaborators with side effects (storage,
//! health probe, app connector, event bus) can be injected, everything else
//! is built from configuration.
//!
//! ```text
//! AgentRegistry ─┐
//! TaskStore ─────┼─► Mailbox
//!                │
//! AppHealthMonitor ──(AppDirectory)──► SessionManager ─► ProxyExecutor
//!        │                                   │         └► ToolCatalog
//!        └──(Weak observers)─────────────────┴──────────────┘
//! ```
//!
//! The monitor only holds weak references to its removal observers, so
//! dropping the bus releases every component.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::{
    AgentRegistry, AgentSweepJob, AppHealthMonitor, Mailbox, ProxyExecutor, Scheduler, SessionManager,
    SessionSweepJob, StoragePurgeJob, TaskStore, ToolCatalog,
};
use crate::domain::app::{AppDirectory, AppRemovalObserver};
use crate::domain::bus_config::{BusConfigManifest, StorageBackendKind};
use crate::domain::health::HealthProbe;
use crate::domain::invocation::AppConnector;
use crate::domain::storage::{Keyspace, Storage};
use crate::infrastructure::db::Database;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::health_probe::HttpHealthProbe;
use crate::infrastructure::mcp_client::McpHttpConnector;
use crate::infrastructure::storage::{MemoryStorage, PostgresStorage};

pub struct ServiceBusBuilder {
    config: BusConfigManifest,
    storage: Option<Arc<dyn Storage>>,
    probe: Option<Arc<dyn HealthProbe>>,
    connector: Option<Arc<dyn AppConnector>>,
    events: Option<EventBus>,
}

impl ServiceBusBuilder {
    pub fn new(config: BusConfigManifest) -> Self {
        Self {
            config,
            storage: None,
            probe: None,
            connector: None,
            events: None,
        }
    }

    /// Use `storage` instead of the configured backend
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn AppConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn build(self) -> Result<ServiceBus> {
        self.config.validate().context("Invalid bus configuration")?;
        let spec = &self.config.spec;

        let storage = match self.storage {
            Some(storage) => storage,
            None => open_storage(&self.config).await?,
        };
        storage
            .ping()
            .await
            .with_context(|| format!("Storage backend '{}' is not reachable", storage.backend_name()))?;

        let keys = Keyspace::new(spec.storage.key_prefix.clone());
        let events = self.events.unwrap_or_default();
        let probe = self.probe.unwrap_or_else(|| Arc::new(HttpHealthProbe::new()));
        let connector: Arc<dyn AppConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(
                McpHttpConnector::new(spec.sessions.connect_timeout).context("Failed to build MCP HTTP client")?,
            ),
        };

        let shutdown = CancellationToken::new();
        let agents = Arc::new(AgentRegistry::new(
            storage.clone(),
            keys.clone(),
            spec.agents.ttl,
            events.clone(),
        ));
        let apps = AppHealthMonitor::new(
            storage.clone(),
            keys.clone(),
            spec.apps.clone(),
            probe,
            events.clone(),
            shutdown.child_token(),
        );
        let directory: Arc<dyn AppDirectory> = apps.clone();
        let sessions = Arc::new(SessionManager::new(
            directory.clone(),
            connector,
            spec.sessions.clone(),
            events.clone(),
        ));
        let proxy = Arc::new(ProxyExecutor::new(
            directory.clone(),
            sessions.clone(),
            spec.proxy.call_timeout,
        ));
        let tools = Arc::new(ToolCatalog::new(directory, sessions.clone(), &spec.proxy));
        let tasks = Arc::new(TaskStore::new(
            storage.clone(),
            keys.clone(),
            spec.tasks.ttl,
            spec.tasks.default_list_limit,
            events.clone(),
        ));
        let mailbox = Arc::new(Mailbox::new(
            storage.clone(),
            keys,
            spec.messages.clone(),
            agents.clone(),
            tasks.clone(),
            events.clone(),
        ));

        let session_observer = Arc::downgrade(&sessions) as Weak<dyn AppRemovalObserver>;
        let tool_observer = Arc::downgrade(&tools) as Weak<dyn AppRemovalObserver>;
        apps.add_observer(session_observer);
        apps.add_observer(tool_observer);

        info!(
            node = %self.config.metadata.name,
            storage = storage.backend_name(),
            "Service bus assembled"
        );

        Ok(ServiceBus {
            scheduler: Scheduler::new(shutdown.child_token()),
            shutdown,
            started: AtomicBool::new(false),
            config: self.config,
            storage,
            events,
            agents,
            apps,
            sessions,
            proxy,
            tools,
            tasks,
            mailbox,
        })
    }
}

async fn open_storage(config: &BusConfigManifest) -> Result<Arc<dyn Storage>> {
    let storage = &config.spec.storage;
    match storage.backend {
        StorageBackendKind::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackendKind::Postgres => {
            let url = storage
                .url
                .as_deref()
                .context("storage.url is required for the postgres backend")?;
            let db = Database::new(url, storage.max_connections).await?;
            let postgres = PostgresStorage::new(&db);
            postgres
                .ensure_schema()
                .await
                .context("Failed to create storage schema")?;
            Ok(Arc::new(postgres))
        }
    }
}

pub struct ServiceBus {
    config: BusConfigManifest,
    shutdown: CancellationToken,
    scheduler: Scheduler,
    started: AtomicBool,
    storage: Arc<dyn Storage>,
    events: EventBus,
    agents: Arc<AgentRegistry>,
    apps: Arc<AppHealthMonitor>,
    sessions: Arc<SessionManager>,
    proxy: Arc<ProxyExecutor>,
    tools: Arc<ToolCatalog>,
    tasks: Arc<TaskStore>,
    mailbox: Arc<Mailbox>,
}

impl ServiceBus {
    pub fn builder(config: BusConfigManifest) -> ServiceBusBuilder {
        ServiceBusBuilder::new(config)
    }

    /// Discard apps left by a previous run and start the periodic jobs.
    /// Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.apps
            .discard_persisted()
            .await
            .context("Failed to discard persisted apps")?;

        let spec = &self.config.spec;
        self.scheduler
            .spawn(Arc::new(AgentSweepJob::new(self.agents.clone(), spec.agents.sweep_interval)));
        self.scheduler
            .spawn(Arc::new(SessionSweepJob::new(self.sessions.clone(), spec.sessions.sweep_interval)));
        self.scheduler
            .spawn(Arc::new(StoragePurgeJob::new(self.storage.clone(), spec.storage.purge_interval)));

        info!(jobs = self.scheduler.running(), "Service bus started");
        Ok(())
    }

    /// Stop every loop and close every session
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.apps.shutdown();
        let closed = self.sessions.close_all().await;
        self.scheduler.join().await;
        info!(sessions_closed = closed, "Service bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &BusConfigManifest {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn apps(&self) -> &Arc<AppHealthMonitor> {
        &self.apps
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn proxy(&self) -> &Arc<ProxyExecutor> {
        &self.proxy
    }

    pub fn tools(&self) -> &Arc<ToolCatalog> {
        &self.tools
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }
}
