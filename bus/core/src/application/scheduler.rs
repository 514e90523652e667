// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Periodic Job Scheduler
//!
//! Every periodic concern (agent TTL sweep, session TTL sweep, storage purge)
//! runs as an isolated loop with its own timer. Loops share nothing but the
//! components they were handed and stop when the shutdown token fires.
//! A failing run is logged and the loop keeps going.
//!
//! Per-app health polling does not go through here: the app monitor owns
//! one loop per registered app so it can start and stop them individually.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::storage::Storage;

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &'static str;

    fn period(&self) -> Duration;

    async fn run_once(&self) -> anyhow::Result<()>;
}

pub struct Scheduler {
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start `job` on its own timer; the first run happens one period from now
    pub fn spawn(&self, job: Arc<dyn PeriodicJob>) {
        let token = self.shutdown.child_token();
        let period = job.period();
        info!(job = job.name(), period = ?period, "Starting periodic job");

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = job.run_once().await {
                            warn!(job = job.name(), error = %e, "Periodic job run failed");
                        }
                    }
                }
            }
            debug!(job = job.name(), "Periodic job stopped");
        });

        self.handles.lock().push(handle);
    }

    /// Number of loops spawned and not yet joined
    pub fn running(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every spawned loop to exit
    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Periodic job panicked");
            }
        }
    }
}

/// Physically drops expired keys from the storage backend
pub struct StoragePurgeJob {
    storage: Arc<dyn Storage>,
    period: Duration,
}

impl StoragePurgeJob {
    pub fn new(storage: Arc<dyn Storage>, period: Duration) -> Self {
        Self { storage, period }
    }
}

#[async_trait]
impl PeriodicJob for StoragePurgeJob {
    fn name(&self) -> &'static str {
        "storage-purge"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let purged = self.storage.purge_expired().await?;
        if purged > 0 {
            debug!(purged, backend = self.storage.backend_name(), "Purged expired keys");
        }
        Ok(())
    }
}
