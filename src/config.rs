use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::registry::RepositoryEntry;

/// Environment variable that overrides `webhook.secret`
pub const SECRET_ENV_VAR: &str = "PUSHSYNC_WEBHOOK_SECRET";

/// Main configuration structure for pushsync
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// INI file declaring one section per repository
    #[serde(default)]
    pub repositories_file: Option<String>,

    /// Repositories declared directly in this file
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryEntry>,

    /// Conventions used to default unset repository fields
    #[serde(default)]
    pub conventions: ConventionConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Webhook verification settings
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Naming conventions applied to repositories that leave fields unset
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConventionConfig {
    /// Working copies default to `<base_directory>/<name>`
    #[serde(default = "default_base_directory")]
    pub base_directory: String,

    /// Bare key names are looked up here
    #[serde(default = "default_key_directory")]
    pub key_directory: String,

    /// Bare script names are looked up here
    #[serde(default = "default_script_directory")]
    pub script_directory: String,

    /// Branch tracked when a repository does not name one
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Remote used when a repository does not name one; `{name}` is substituted
    #[serde(default)]
    pub remote_url_template: Option<String>,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Maximum sync invocations running at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for a whole sync invocation in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Check the remote host key against known_hosts
    #[serde(default = "default_true")]
    pub verify_host_identity: bool,

    /// Remove untracked files after a hard reset
    #[serde(default = "default_true")]
    pub clean_untracked: bool,

    /// Clean up failed clone attempts
    #[serde(default = "default_true")]
    pub cleanup_on_error: bool,
}

/// Webhook configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct WebhookConfig {
    /// Shared secret used to sign deliveries
    #[serde(default)]
    pub secret: Option<String>,

    /// Accept deliveries without checking their signature (debugging only)
    #[serde(default)]
    pub skip_verification: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "json"
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_base_directory() -> String {
    "/var/www/html".to_string()
}
fn default_key_directory() -> String {
    "/var/www/.ssh".to_string()
}
fn default_script_directory() -> String {
    "/var/www/.scripts".to_string()
}
fn default_branch() -> String {
    "master".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_timeout() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for ConventionConfig {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            key_directory: default_key_directory(),
            script_directory: default_script_directory(),
            default_branch: default_branch(),
            remote_url_template: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            timeout: default_timeout(),
            verify_host_identity: default_true(),
            clean_untracked: default_true(),
            cleanup_on_error: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to built-in defaults
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!("No configuration at {:?}, using defaults", config_path);
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;
        config.apply_env_overrides();

        Ok(config)
    }

    /// Reject values no invocation could run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.sync.timeout > 0, "sync.timeout must be at least 1 second");
        anyhow::ensure!(self.sync.max_parallel > 0, "sync.max_parallel must be at least 1");
        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("pushsync").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        if let Some(file) = &self.repositories_file {
            self.repositories_file = Some(
                shellexpand::full(file)
                    .context("Failed to expand repositories_file path")?
                    .into_owned(),
            );
        }

        let conventions = &mut self.conventions;
        conventions.base_directory = shellexpand::full(&conventions.base_directory)
            .context("Failed to expand base_directory path")?
            .into_owned();

        conventions.key_directory = shellexpand::full(&conventions.key_directory)
            .context("Failed to expand key_directory path")?
            .into_owned();

        conventions.script_directory = shellexpand::full(&conventions.script_directory)
            .context("Failed to expand script_directory path")?
            .into_owned();

        Ok(())
    }

    /// Apply overrides taken from the process environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var(SECRET_ENV_VAR) {
            if !secret.is_empty() {
                self.webhook.secret = Some(secret);
            }
        }
    }

    /// Per-invocation timeout as a `Duration`
    pub fn sync_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync.timeout)
    }
}
