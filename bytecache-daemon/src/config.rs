//! Configuration file loading and management
//!
//! This module handles loading and parsing the daemon configuration from
//! `$XDG_CONFIG_HOME/bytecache/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::{DeviceConditions, ExistingJobPolicy, NetworkState, REFRESH_JOB_NAME};

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CacheConfig {
    /// Path to cache database (SQLite)
    /// If None, uses XDG_DATA_HOME/bytecache/cache.db
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Remote catalog settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub url: String,
    /// Request timeout in seconds
    /// Default: 30
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    pub job_name: String,
    pub period_hours: u64,
    /// How often unmet constraints are re-checked
    pub condition_poll_secs: u64,
    pub policy: ExistingJobPolicy,
    #[serde(default)]
    pub conditions: ConditionsConfig,
}

/// Device conditions reported to the scheduler by the static probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionsConfig {
    pub network: NetworkState,
    #[serde(default)]
    pub battery_low: bool,
    #[serde(default)]
    pub charging: bool,
    /// Omit when the platform cannot report idleness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle: Option<bool>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: provider_devbytes::DEFAULT_CATALOG_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_name: REFRESH_JOB_NAME.to_string(),
            period_hours: 24,
            condition_poll_secs: 60,
            policy: ExistingJobPolicy::Keep,
            conditions: ConditionsConfig::default(),
        }
    }
}

impl Default for ConditionsConfig {
    fn default() -> Self {
        Self {
            network: NetworkState::Unmetered,
            battery_low: false,
            charging: true,
            idle: None,
        }
    }
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SchedulerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_hours * 60 * 60)
    }

    pub fn condition_poll(&self) -> Duration {
        Duration::from_secs(self.condition_poll_secs)
    }
}

impl From<&ConditionsConfig> for DeviceConditions {
    fn from(config: &ConditionsConfig) -> Self {
        Self {
            network: config.network,
            battery_low: config.battery_low,
            charging: config.charging,
            idle: config.idle,
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Returns `$XDG_CONFIG_HOME/bytecache/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "raibid-labs", "bytecache")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Default configuration file content with comments
    fn default_config_content() -> String {
        r#"# bytecache daemon configuration

[daemon]
# Log level: trace, debug, info, warn, error
# RUST_LOG takes precedence when set.
log_level = "info"

[cache]
# Path to the SQLite cache database
# If not specified, defaults to $XDG_DATA_HOME/bytecache/cache.db
# path = "/path/to/cache.db"

[source]
# Catalog endpoint
url = "https://android-kotlin-fun.appspot.com/devbytes"

# Request timeout in seconds
timeout_secs = 30

[scheduler]
# Unique name of the refresh job
job_name = "catalog-refresh"

# How often the catalog is refreshed
period_hours = 24

# How often to re-check device conditions while a due refresh is deferred
condition_poll_secs = 60

# What to do if the job is already registered: keep, replace
policy = "keep"

# Device conditions reported to the scheduler.
# The refresh only runs on an unmetered network, with the battery not low,
# while charging, and while idle where idleness can be reported.
[scheduler.conditions]
# disconnected, metered, unmetered
network = "unmetered"
battery_low = false
charging = true
# idle = true
"#
        .to_string()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                valid_log_levels.join(", ")
            );
        }

        let url = self.source.url.as_str();
        let has_scheme = url.starts_with("http://") || url.starts_with("https://");
        if !has_scheme || url.trim_start_matches("https://").trim_start_matches("http://").is_empty() {
            anyhow::bail!("Invalid source.url: {}. Must be an http(s) URL", url);
        }

        if self.source.timeout_secs == 0 {
            anyhow::bail!("source.timeout_secs must be greater than 0");
        }

        if self.scheduler.job_name.trim().is_empty() {
            anyhow::bail!("scheduler.job_name must not be empty");
        }

        if self.scheduler.period_hours == 0 {
            anyhow::bail!("scheduler.period_hours must be greater than 0");
        }

        if self.scheduler.condition_poll_secs == 0 {
            anyhow::bail!("scheduler.condition_poll_secs must be greater than 0");
        }

        Ok(())
    }

    /// Get the cache database path
    ///
    /// Returns the configured cache path or the default XDG data directory path
    pub fn cache_path(&self) -> Result<PathBuf> {
        match &self.cache.path {
            Some(path) => Ok(path.clone()),
            None => crate::cache::SqliteCache::default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load_str(content: &str) -> Result<Config> {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        Config::load(temp_file.path())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.log_level, "info");
        assert!(config.cache.path.is_none());
        assert_eq!(config.source.url, provider_devbytes::DEFAULT_CATALOG_URL);
        assert_eq!(config.source.timeout(), Duration::from_secs(30));
        assert_eq!(config.scheduler.job_name, "catalog-refresh");
        assert_eq!(config.scheduler.period(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.scheduler.policy, ExistingJobPolicy::Keep);
        assert_eq!(config.scheduler.conditions.network, NetworkState::Unmetered);
        assert!(config.scheduler.conditions.idle.is_none());
    }

    #[test]
    fn test_default_content_parses_to_defaults() {
        let config = load_str(&Config::default_config_content()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_valid_config() {
        let config = load_str(
            r#"
[daemon]
log_level = "debug"

[cache]
path = "/tmp/bytecache-test.db"

[source]
url = "http://localhost:8080/devbytes"
timeout_secs = 5

[scheduler]
job_name = "nightly"
period_hours = 12
condition_poll_secs = 30
policy = "replace"

[scheduler.conditions]
network = "metered"
battery_low = true
charging = false
idle = true
"#,
        )
        .unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(
            config.cache_path().unwrap(),
            PathBuf::from("/tmp/bytecache-test.db")
        );
        assert_eq!(config.source.timeout(), Duration::from_secs(5));
        assert_eq!(config.scheduler.job_name, "nightly");
        assert_eq!(config.scheduler.condition_poll(), Duration::from_secs(30));
        assert_eq!(config.scheduler.policy, ExistingJobPolicy::Replace);

        let conditions = DeviceConditions::from(&config.scheduler.conditions);
        assert_eq!(conditions.network, NetworkState::Metered);
        assert!(conditions.battery_low);
        assert!(!conditions.charging);
        assert_eq!(conditions.idle, Some(true));
    }

    #[test]
    fn test_load_minimal_config() {
        let config = load_str(
            r#"
[daemon]
log_level = "warn"
"#,
        )
        .unwrap();

        assert_eq!(config.daemon.log_level, "warn");
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_load_rejects_unknown_policy() {
        let result = load_str(
            r#"
[scheduler]
job_name = "catalog-refresh"
period_hours = 24
condition_poll_secs = 60
policy = "append"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/bytecache/config.toml").is_err());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_url() {
        let mut config = Config::default();
        config.source.url = "ftp://example.com/devbytes".to_string();
        assert!(config.validate().is_err());

        config.source.url = "https://".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = Config::default();
        config.source.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.period_hours = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.condition_poll_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_job_name() {
        let mut config = Config::default();
        config.scheduler.job_name = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
