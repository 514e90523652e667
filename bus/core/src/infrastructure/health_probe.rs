// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP health probe: a bounded GET, healthy only on a 2xx answer.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::health::{HealthProbe, ProbeOutcome};

#[derive(Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let outcome = match self.client.get(url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => ProbeOutcome::Unhealthy {
                status: response.status().as_u16(),
            },
            Err(e) if e.is_timeout() => ProbeOutcome::TimedOut,
            Err(e) => ProbeOutcome::Unreachable {
                reason: e.to_string(),
            },
        };
        debug!(url, outcome = outcome.label(), "Health probe finished");
        outcome
    }
}
