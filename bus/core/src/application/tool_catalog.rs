// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tool Catalog
//!
//! Lists an app's tools through the calling agent's session. Listings are
//! cached per app in a bounded LRU for `proxy.tool_cache_ttl`; the tool set
//! belongs to the app, not the session, so any agent may warm the entry.
//!
//! The app is resolved and health-checked on every call, cache hit or not.
//! A listing fetched across a `clear` is returned but never cached.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::application::session_manager::SessionManager;
use crate::domain::agent::AgentId;
use crate::domain::app::{AppDirectory, AppId, AppRemovalObserver, AppRemovalReason};
use crate::domain::bus_config::ProxyConfig;
use crate::domain::error::BusError;
use crate::domain::invocation::{InvocationError, ToolDescriptor};

struct CachedTools {
    tools: Arc<Vec<ToolDescriptor>>,
    fetched_at: Instant,
}

struct Cache {
    entries: LruCache<AppId, CachedTools>,
    /// Bumped by every `clear`
    generation: u64,
}

pub struct ToolCatalog {
    apps: Arc<dyn AppDirectory>,
    sessions: Arc<SessionManager>,
    call_timeout: Duration,
    cache_ttl: Duration,
    cache: Mutex<Cache>,
}

impl ToolCatalog {
    pub fn new(apps: Arc<dyn AppDirectory>, sessions: Arc<SessionManager>, config: &ProxyConfig) -> Self {
        let capacity = NonZeroUsize::new(config.tool_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            apps,
            sessions,
            call_timeout: config.call_timeout,
            cache_ttl: config.tool_cache_ttl,
            cache: Mutex::new(Cache {
                entries: LruCache::new(capacity),
                generation: 0,
            }),
        }
    }

    pub async fn list_tools(&self, agent_id: AgentId, app_id: AppId) -> Result<Arc<Vec<ToolDescriptor>>, BusError> {
        let app = self.apps.resolve(app_id).await?;
        if !app.healthy {
            return Err(BusError::AppUnhealthy { app_id });
        }
        if let Some(tools) = self.cached(app_id) {
            return Ok(tools);
        }

        let generation = self.cache.lock().generation;
        let mut session = self.sessions.get_or_create(agent_id, app_id).await?;
        let mut replaced = false;
        let tools = loop {
            let outcome = tokio::time::timeout(self.call_timeout, session.connection().list_tools()).await;
            session.touch();
            match outcome {
                Ok(Ok(tools)) => break tools,
                Ok(Err(InvocationError::Disconnected(reason))) => {
                    if replaced {
                        self.sessions.discard(&session).await;
                        return Err(BusError::SessionUnavailable {
                            agent_id,
                            app_id,
                            reason,
                        });
                    }
                    replaced = true;
                    session = self.sessions.replace_broken(&session).await?;
                }
                Ok(Err(e)) => {
                    return Err(BusError::UpstreamError {
                        app_id,
                        message: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(BusError::UpstreamTimeout {
                        app_id,
                        tool: "tools/list".to_string(),
                        timeout: self.call_timeout,
                    })
                }
            }
        };

        let tools = Arc::new(tools);
        let mut cache = self.cache.lock();
        if cache.generation == generation {
            debug!(app_id = %app_id, count = tools.len(), "Tool listing cached");
            cache.entries.put(
                app_id,
                CachedTools {
                    tools: tools.clone(),
                    fetched_at: Instant::now(),
                },
            );
        } else {
            debug!(app_id = %app_id, "Catalog cleared during listing; not caching");
        }
        Ok(tools)
    }

    /// Drop one app's entry, or everything
    pub fn clear(&self, app_id: Option<AppId>) {
        let mut cache = self.cache.lock();
        cache.generation += 1;
        match app_id {
            Some(app_id) => {
                cache.entries.pop(&app_id);
            }
            None => cache.entries.clear(),
        }
    }

    pub fn cached_apps(&self) -> usize {
        self.cache.lock().entries.len()
    }

    fn cached(&self, app_id: AppId) -> Option<Arc<Vec<ToolDescriptor>>> {
        let mut cache = self.cache.lock();
        let fresh = cache.entries.get(&app_id).map(|entry| {
            (entry.fetched_at.elapsed() < self.cache_ttl).then(|| entry.tools.clone())
        })?;
        if fresh.is_none() {
            cache.entries.pop(&app_id);
        }
        fresh
    }
}

#[async_trait]
impl AppRemovalObserver for ToolCatalog {
    async fn app_removed(&self, app_id: AppId, _reason: AppRemovalReason) {
        self.clear(Some(app_id));
    }

    async fn app_endpoint_changed(&self, app_id: AppId) {
        self.clear(Some(app_id));
    }
}
