//! Configuration management for vault agents
//!
//! This module provides configuration structures for vault-level settings,
//! including the agent role, polling intervals, circuit-breaker thresholds,
//! retry policy defaults and subprocess-backed channel processors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Result, VaultError};

/// Environment variable overriding the vault root
pub const VAULT_PATH_ENV: &str = "VAULT_PATH";

/// Environment variable overriding the agent role
pub const AGENT_ROLE_ENV: &str = "AGENT_ROLE";

/// Identity an agent process asserts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Full-trust agent allowed to execute sensitive actions
    #[default]
    Local,
    /// Restricted, draft-only agent
    Cloud,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }
}

/// Vault-level configuration
///
/// Loaded from `.vault/config.toml` under the vault root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Role this process asserts
    #[serde(default)]
    pub role: AgentRole,

    /// Bytes of content hashed into an approval signature
    #[serde(default = "default_signature_prefix_bytes")]
    pub signature_prefix_bytes: usize,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub offline_queue: OfflineQueueConfig,

    #[serde(default)]
    pub cloud_integration: CloudIntegrationConfig,

    /// Subprocess-backed channel processors
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
}

/// Polling intervals per agent loop, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_orchestrator_secs")]
    pub orchestrator_secs: u64,

    #[serde(default = "default_agent_secs")]
    pub local_executive_secs: u64,

    #[serde(default = "default_agent_secs")]
    pub cloud_draft_secs: u64,

    #[serde(default = "default_orchestrator_secs")]
    pub cloud_integration_secs: u64,
}

/// Circuit-breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before a service is marked unavailable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an unavailable service waits before a retry is allowed
    #[serde(default = "default_recovery_window_secs")]
    pub recovery_window_secs: u64,
}

/// Retry policy defaults for channel processor calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
}

/// Offline queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueConfig {
    /// Attempts before a queued item is marked failed
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: u32,

    /// Priority used when a caller does not give one (1 = highest)
    #[serde(default = "default_priority")]
    pub default_priority: u8,
}

/// Cloud integration worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudIntegrationConfig {
    /// Glob patterns in `Needs_Action/cloud` owned by the integration worker
    #[serde(default = "default_integration_patterns")]
    pub patterns: Vec<String>,
}

/// A channel processor backed by an external command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Processor name, reported in outcomes
    pub name: String,

    /// Kind tags this processor handles (e.g. `email-send`)
    pub kinds: Vec<String>,

    /// Service name tracked by the health monitor
    #[serde(default)]
    pub service: Option<String>,

    /// Program and arguments; the work-item path is appended
    pub command: Vec<String>,

    /// Metadata keys every item must carry
    #[serde(default)]
    pub required_metadata: Vec<String>,

    /// Only a local-role agent may run this processor
    #[serde(default = "default_true")]
    pub local_only: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Default value providers
fn default_signature_prefix_bytes() -> usize {
    64 * 1024
}

fn default_orchestrator_secs() -> u64 {
    30
}

fn default_agent_secs() -> u64 {
    20
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_window_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_queue_max_attempts() -> u32 {
    5
}

fn default_priority() -> u8 {
    5
}

fn default_integration_patterns() -> Vec<String> {
    vec!["ODOO_DRAFT_INVOICE_*.md".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    120
}

impl VaultConfig {
    /// Load configuration from `.vault/config.toml` or use defaults
    pub fn load_or_default(vault_root: &Path) -> Result<Self> {
        let config_path = Self::path(vault_root);

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| VaultError::Config(format!("Failed to parse config file: {}", e)))?
        } else {
            Self::default()
        };

        config.apply_env()?;
        Ok(config)
    }

    /// Write default configuration to `.vault/config.toml`
    pub fn write_default(vault_root: &Path) -> Result<PathBuf> {
        let config_path = Self::path(vault_root);
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| VaultError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    pub fn path(vault_root: &Path) -> PathBuf {
        vault_root.join(".vault").join("config.toml")
    }

    /// Resolve the vault root: explicit flag, then `VAULT_PATH`, then `./vault`
    pub fn resolve_root(explicit: Option<PathBuf>) -> PathBuf {
        let root = explicit
            .or_else(|| std::env::var_os(VAULT_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("vault"));
        // Follow a symlinked vault so renames stay on the target filesystem
        std::fs::canonicalize(&root).unwrap_or(root)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(role) = std::env::var(AGENT_ROLE_ENV) {
            self.role = role.parse().map_err(VaultError::Config)?;
        }
        Ok(())
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            role: AgentRole::default(),
            signature_prefix_bytes: default_signature_prefix_bytes(),
            poll: PollConfig::default(),
            health: HealthConfig::default(),
            retry: RetryConfig::default(),
            offline_queue: OfflineQueueConfig::default(),
            cloud_integration: CloudIntegrationConfig::default(),
            processors: Vec::new(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            orchestrator_secs: default_orchestrator_secs(),
            local_executive_secs: default_agent_secs(),
            cloud_draft_secs: default_agent_secs(),
            cloud_integration_secs: default_orchestrator_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_window_secs: default_recovery_window_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_base: default_backoff_base(),
        }
    }
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_queue_max_attempts(),
            default_priority: default_priority(),
        }
    }
}

impl Default for CloudIntegrationConfig {
    fn default() -> Self {
        Self {
            patterns: default_integration_patterns(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.role, AgentRole::Local);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.recovery_window_secs, 300);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.offline_queue.max_attempts, 5);
        assert!(config.processors.is_empty());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: VaultConfig = toml::from_str(
            r#"
role = "cloud"

[health]
failure_threshold = 5

[[processors]]
name = "mailer"
kinds = ["email-send"]
command = ["send-mail", "--quiet"]
required_metadata = ["to", "subject"]
"#,
        )
        .unwrap();

        assert_eq!(config.role, AgentRole::Cloud);
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.recovery_window_secs, 300);
        assert_eq!(config.processors.len(), 1);
        assert!(config.processors[0].local_only);
        assert_eq!(config.processors[0].timeout_secs, 120);
    }

    #[test]
    fn test_write_default_then_load() {
        let dir = TempDir::new().unwrap();
        let path = VaultConfig::write_default(dir.path()).unwrap();
        assert!(path.ends_with(".vault/config.toml"));

        let loaded = VaultConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.poll.orchestrator_secs, 30);
        assert_eq!(
            loaded.cloud_integration.patterns,
            vec!["ODOO_DRAFT_INVOICE_*.md".to_string()]
        );
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(" Cloud ".parse::<AgentRole>().unwrap(), AgentRole::Cloud);
        assert!("remote".parse::<AgentRole>().is_err());
    }
}
