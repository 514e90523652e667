// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! App
//!
//! Scenario-specific capability providers. An app is reachable only through
//! its health-checked endpoint and its MCP invocation endpoint; the bus keeps
//! no state about it beyond the record below.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** App aggregate plus the seams the session pool uses to
//!   resolve apps and learn about their removal

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::advance;
use crate::domain::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub Uuid);

impl AppId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for AppId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptive card an app submits when registering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppCard {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Usage scenario, shown to agents choosing between apps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    pub mcp_endpoint: String,
    pub health_check_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AppCard {
    pub fn new(
        name: impl Into<String>,
        mcp_endpoint: impl Into<String>,
        health_check_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            scenario: None,
            mcp_endpoint: mcp_endpoint.into(),
            health_check_url: health_check_url.into(),
            icon_url: None,
            tags: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.name.trim().is_empty() {
            return Err(BusError::invalid_input("app card name cannot be empty"));
        }
        validate_http_url("health_check_url", &self.health_check_url)?;
        validate_http_url("mcp_endpoint", &self.mcp_endpoint)?;
        Ok(())
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<(), BusError> {
    if value.trim().is_empty() {
        return Err(BusError::invalid_input(format!("{} is required", field)));
    }
    let parsed = url::Url::parse(value)
        .map_err(|e| BusError::invalid_input(format!("{} '{}' is not a valid URL: {}", field, value, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(BusError::invalid_input(format!(
            "{} must use http or https, got '{}'",
            field, other
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: AppId,
    pub card: AppCard,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub healthy: bool,
    #[serde(default)]
    pub(crate) consecutive_failures: u32,
}

impl AppRecord {
    pub fn new(card: AppCard, now: DateTime<Utc>) -> Self {
        Self {
            id: AppId::new(),
            card,
            registered_at: now,
            last_seen_at: now,
            healthy: true,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Re-registration: replace the card and start health tracking afresh
    pub fn renew(&mut self, card: AppCard, now: DateTime<Utc>) {
        self.card = card;
        self.healthy = true;
        self.consecutive_failures = 0;
        self.last_seen_at = advance(self.last_seen_at, now);
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.healthy = true;
        self.consecutive_failures = 0;
        self.last_seen_at = advance(self.last_seen_at, now);
    }

    /// Count one failed probe; returns the new consecutive-failure count
    pub fn record_failure(&mut self) -> u32 {
        self.healthy = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }
}

/// Why an app left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppRemovalReason {
    Unregistered,
    Unhealthy,
}

impl AppRemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppRemovalReason::Unregistered => "unregistered",
            AppRemovalReason::Unhealthy => "unhealthy",
        }
    }
}

/// Read access to the app registry
#[async_trait]
pub trait AppDirectory: Send + Sync {
    /// Resolve an app; fails with NotFound when absent
    async fn resolve(&self, app_id: AppId) -> Result<AppRecord, BusError>;
}

/// Notified synchronously when an app is removed or its endpoint changes
#[async_trait]
pub trait AppRemovalObserver: Send + Sync {
    async fn app_removed(&self, app_id: AppId, reason: AppRemovalReason);

    async fn app_endpoint_changed(&self, app_id: AppId);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> AppCard {
        AppCard::new("weather", "http://localhost:9000/mcp", "http://localhost:9000/health")
    }

    #[test]
    fn test_card_validation() {
        assert!(card().validate().is_ok());

        let mut missing_health = card();
        missing_health.health_check_url = String::new();
        assert!(matches!(missing_health.validate(), Err(BusError::InvalidInput(_))));

        let mut bad_scheme = card();
        bad_scheme.mcp_endpoint = "ftp://localhost/mcp".to_string();
        assert!(bad_scheme.validate().is_err());
    }

    #[test]
    fn test_failure_then_success_resets_counter() {
        let now = Utc::now();
        let mut record = AppRecord::new(card(), now);
        assert_eq!(record.record_failure(), 1);
        assert_eq!(record.record_failure(), 2);
        assert!(!record.healthy);

        record.record_success(now);
        assert!(record.healthy);
        assert_eq!(record.consecutive_failures(), 0);
        assert!(record.last_seen_at > now);
    }
}
