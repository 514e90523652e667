// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_registry;
pub mod app_monitor;
pub mod mailbox;
pub mod proxy_executor;
pub mod scheduler;
pub mod session_manager;
pub mod task_store;
pub mod tool_catalog;

pub use agent_registry::{AgentRegistry, AgentSweepJob};
pub use app_monitor::{AppHealthMonitor, HealthVerdict};
pub use mailbox::Mailbox;
pub use proxy_executor::ProxyExecutor;
pub use scheduler::{PeriodicJob, Scheduler, StoragePurgeJob};
pub use session_manager::{AppSession, SessionManager, SessionSweepJob};
pub use task_store::TaskStore;
pub use tool_catalog::ToolCatalog;

/// Convert a configured TTL to a chrono span, saturating on overflow
pub(crate) fn chrono_span(ttl: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
