// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Health-check contract consumed by the app health monitor.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of polling one health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy { status: u16 },
    TimedOut,
    Unreachable { reason: String },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }

    /// Low-cardinality label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Healthy => "healthy",
            ProbeOutcome::Unhealthy { .. } => "unhealthy",
            ProbeOutcome::TimedOut => "timed_out",
            ProbeOutcome::Unreachable { .. } => "unreachable",
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Poll `url` once; must give up after `timeout`
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}
