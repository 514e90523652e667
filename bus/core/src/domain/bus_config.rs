// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Bus Configuration Types
//
// Defines the configuration schema for an agentbus node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Storage backend selection (volatile or PostgreSQL)
// - Registry TTLs, health polling and session pool bounds
// - Proxy timeouts and tool catalog caching
// - Observability settings
//
// Durations use humantime notation ("30s", "30m", "7d").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "agentbus/v1";
pub const KIND: &str = "BusConfig";
pub const CONFIG_PATH_ENV: &str = "AGENTBUS_CONFIG_PATH";

/// Top-level Kubernetes-style bus configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfigManifest {
    /// API version (must be "agentbus/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "BusConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: BusConfigSpec,
}

pub type BusConfig = BusConfigManifest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable bus name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfigSpec {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub agents: AgentRegistryConfig,

    #[serde(default)]
    pub apps: AppMonitorConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub tasks: TaskStoreConfig,

    #[serde(default)]
    pub messages: MailboxConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Connection string, required for the postgres backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How often expired keys are physically dropped
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistryConfig {
    #[serde(default = "default_agent_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMonitorConfig {
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    #[serde(default = "default_health_check_timeout", with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// Consecutive failed probes after which an app is removed
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sliding idle window; every use pushes expiry to `last_used + ttl`
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(default = "default_max_sessions_per_agent")]
    pub max_per_agent: usize,

    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Per-call bound on a proxied tool invocation
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,

    #[serde(default = "default_tool_cache_ttl", with = "humantime_serde")]
    pub tool_cache_ttl: Duration,

    #[serde(default = "default_tool_cache_capacity")]
    pub tool_cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStoreConfig {
    #[serde(default = "default_task_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(default = "default_list_limit")]
    pub default_list_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    #[serde(default = "default_message_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(default = "default_receive_limit")]
    pub receive_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_key_prefix() -> String {
    "agentbus:".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_agent_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_sessions_per_agent() -> usize {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_tool_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_tool_cache_capacity() -> usize {
    256
}

fn default_task_ttl() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_list_limit() -> usize {
    50
}

fn default_message_ttl() -> Duration {
    Duration::from_secs(3 * 24 * 3600)
}

fn default_receive_limit() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Memory,
            url: None,
            key_prefix: default_key_prefix(),
            max_connections: default_max_connections(),
            purge_interval: default_purge_interval(),
        }
    }
}

impl Default for AgentRegistryConfig {
    fn default() -> Self {
        Self {
            ttl: default_agent_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for AppMonitorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            health_check_timeout: default_health_check_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_session_ttl(),
            max_per_agent: default_max_sessions_per_agent(),
            sweep_interval: default_sweep_interval(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
            tool_cache_ttl: default_tool_cache_ttl(),
            tool_cache_capacity: default_tool_cache_capacity(),
        }
    }
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            ttl: default_task_ttl(),
            default_list_limit: default_list_limit(),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            ttl: default_message_ttl(),
            receive_limit: default_receive_limit(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_bind_address(),
            port: default_metrics_port(),
        }
    }
}

impl Default for BusConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "agentbus".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: BusConfigSpec::default(),
        }
    }
}

impl BusConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AGENTBUS_CONFIG_PATH environment variable
    /// 2. ./agentbus-config.yaml (working directory)
    /// 3. ~/.agentbus/config.yaml (user home)
    /// 4. /etc/agentbus/config.yaml (system, Unix) or C:\ProgramData\Agentbus\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./agentbus-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".agentbus").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/agentbus/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Agentbus\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails hard when missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("AGENTBUS_STORAGE_BACKEND") {
            match val.to_lowercase().as_str() {
                "memory" => self.spec.storage.backend = StorageBackendKind::Memory,
                "postgres" | "postgresql" => self.spec.storage.backend = StorageBackendKind::Postgres,
                _ => {
                    tracing::warn!(
                        "Invalid value for AGENTBUS_STORAGE_BACKEND: '{}'. Expected memory/postgres. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Some(url) = lookup("AGENTBUS_DATABASE_URL") {
            tracing::info!("Environment override: AGENTBUS_DATABASE_URL");
            self.spec.storage.url = Some(url);
        }

        if let Some(prefix) = lookup("AGENTBUS_KEY_PREFIX") {
            self.spec.storage.key_prefix = prefix;
        }

        if let Some(level) = lookup("AGENTBUS_LOG_LEVEL") {
            self.spec.observability.log_level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.storage.backend == StorageBackendKind::Postgres
            && spec.storage.url.as_deref().map_or(true, str::is_empty)
        {
            anyhow::bail!("spec.storage.url is required for the postgres backend");
        }

        let positive = [
            ("spec.storage.purge_interval", spec.storage.purge_interval),
            ("spec.agents.ttl", spec.agents.ttl),
            ("spec.agents.sweep_interval", spec.agents.sweep_interval),
            ("spec.apps.health_check_interval", spec.apps.health_check_interval),
            ("spec.apps.health_check_timeout", spec.apps.health_check_timeout),
            ("spec.sessions.ttl", spec.sessions.ttl),
            ("spec.sessions.sweep_interval", spec.sessions.sweep_interval),
            ("spec.sessions.connect_timeout", spec.sessions.connect_timeout),
            ("spec.proxy.call_timeout", spec.proxy.call_timeout),
            ("spec.tasks.ttl", spec.tasks.ttl),
            ("spec.messages.ttl", spec.messages.ttl),
        ];
        for (field, value) in positive {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than zero", field);
            }
        }

        if spec.apps.health_check_timeout > spec.apps.health_check_interval {
            anyhow::bail!(
                "spec.apps.health_check_timeout ({:?}) cannot exceed health_check_interval ({:?})",
                spec.apps.health_check_timeout,
                spec.apps.health_check_interval
            );
        }

        if spec.apps.unhealthy_threshold == 0 {
            anyhow::bail!("spec.apps.unhealthy_threshold must be at least 1");
        }

        if spec.sessions.max_per_agent == 0 {
            anyhow::bail!("spec.sessions.max_per_agent must be at least 1");
        }

        if spec.proxy.tool_cache_capacity == 0 {
            anyhow::bail!("spec.proxy.tool_cache_capacity must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = BusConfigManifest::default();
        assert_eq!(manifest.api_version, "agentbus/v1");
        assert_eq!(manifest.kind, "BusConfig");
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.storage.backend, StorageBackendKind::Memory);
        assert_eq!(manifest.spec.agents.ttl, Duration::from_secs(60));
        assert_eq!(manifest.spec.apps.unhealthy_threshold, 3);
        assert_eq!(manifest.spec.sessions.max_per_agent, 10);
        assert_eq!(manifest.spec.sessions.ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_minimal_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: agentbus/v1
kind: BusConfig
metadata:
  name: test-bus
spec:
  apps:
    health_check_interval: 10s
    unhealthy_threshold: 5
  sessions:
    ttl: 15m
  tasks:
    ttl: 7d
"#;
        let manifest = BusConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "test-bus");
        assert_eq!(manifest.spec.apps.health_check_interval, Duration::from_secs(10));
        assert_eq!(manifest.spec.apps.health_check_timeout, Duration::from_secs(5));
        assert_eq!(manifest.spec.apps.unhealthy_threshold, 5);
        assert_eq!(manifest.spec.sessions.ttl, Duration::from_secs(900));
        assert_eq!(manifest.spec.tasks.ttl, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(manifest.spec.proxy.call_timeout, Duration::from_secs(30));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let mut manifest = BusConfigManifest::default();
        manifest.metadata.name = "roundtrip".to_string();
        manifest.spec.storage.backend = StorageBackendKind::Postgres;
        manifest.spec.storage.url = Some("postgres://bus@localhost/bus".to_string());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentbus-config.yaml");
        manifest.to_yaml_file(&path).unwrap();

        let parsed = BusConfigManifest::from_yaml_file(&path).unwrap();
        assert_eq!(parsed.metadata.name, "roundtrip");
        assert_eq!(parsed.spec.storage.backend, StorageBackendKind::Postgres);
        assert_eq!(parsed.spec.storage.url.as_deref(), Some("postgres://bus@localhost/bus"));
        assert_eq!(parsed.spec.sessions.ttl, manifest.spec.sessions.ttl);
    }

    #[test]
    fn test_load_or_default_fails_on_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(BusConfigManifest::load_or_default(Some(missing)).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut manifest = BusConfigManifest::default();
        manifest.apply_overrides_from(|key| match key {
            "AGENTBUS_STORAGE_BACKEND" => Some("postgres".to_string()),
            "AGENTBUS_DATABASE_URL" => Some("postgres://localhost/bus".to_string()),
            "AGENTBUS_LOG_LEVEL" => Some("debug".to_string()),
            _ => None,
        });
        assert_eq!(manifest.spec.storage.backend, StorageBackendKind::Postgres);
        assert_eq!(manifest.spec.storage.url.as_deref(), Some("postgres://localhost/bus"));
        assert_eq!(manifest.spec.observability.log_level, "debug");
        assert_eq!(manifest.spec.storage.key_prefix, "agentbus:");
    }

    #[test]
    fn test_validation() {
        let mut manifest = BusConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.storage.backend = StorageBackendKind::Postgres;
        assert!(manifest.validate().is_err());
        manifest.spec.storage.backend = StorageBackendKind::Memory;

        manifest.spec.apps.unhealthy_threshold = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.apps.unhealthy_threshold = 3;

        manifest.spec.apps.health_check_timeout = Duration::from_secs(60);
        assert!(manifest.validate().is_err());
        manifest.spec.apps.health_check_timeout = Duration::from_secs(5);

        manifest.spec.sessions.max_per_agent = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.sessions.max_per_agent = 10;

        manifest.spec.proxy.call_timeout = Duration::ZERO;
        assert!(manifest.validate().is_err());
    }
}
