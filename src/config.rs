//! Configuration management for Bulwark.

use serde::{Deserialize, Serialize};

use crate::error::{BulwarkError, Result};
use crate::ratelimit::{RateLimitRules, DEFAULT_RETENTION_HOURS, MAX_RETENTION_HOURS};

/// Prefix for environment overrides, e.g. `BULWARK__STORAGE__DATABASE_URL`.
pub const ENV_PREFIX: &str = "BULWARK";

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Attempt log storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Retention cleanup
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which attempt store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory; lost on exit
    Memory,
    /// A SQLite database
    #[default]
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Pool size for file-backed databases
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://bulwark.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Limit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Path to a YAML rules file; replaces `rules` when set
    pub rules_path: Option<String>,

    /// Inline rules
    #[serde(default)]
    pub rules: RateLimitRules,
}

impl LimitsConfig {
    /// Resolve the rules to run with.
    pub fn load_rules(&self) -> Result<RateLimitRules> {
        match &self.rules_path {
            Some(path) => RateLimitRules::from_file(path),
            None => {
                self.rules.validate()?;
                Ok(self.rules.clone())
            }
        }
    }
}

/// Cleanup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Attempts older than this many hours are ignored and deleted
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,

    /// Interval between cleanup runs in `janitor` mode, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_retention_hours() -> u32 {
    DEFAULT_RETENTION_HOURS
}

fn default_cleanup_interval() -> u64 {
    3600
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BulwarkConfig {
    /// Load configuration from a YAML file only.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BulwarkConfig = serde_yaml::from_str(&contents)
            .map_err(|e| BulwarkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file, then environment
    /// variables prefixed with `BULWARK__`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Yaml));
        }

        let config: BulwarkConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BulwarkError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.storage.database_url.is_empty() && self.storage.backend == StorageBackend::Sqlite {
            return Err(BulwarkError::Config("storage.database_url is required".to_string()));
        }
        if !(1..=MAX_RETENTION_HOURS).contains(&self.cleanup.retention_hours) {
            return Err(BulwarkError::Config(format!(
                "cleanup.retention_hours must be between 1 and {}",
                MAX_RETENTION_HOURS
            )));
        }
        if self.cleanup.interval_secs == 0 {
            return Err(BulwarkError::Config(
                "cleanup.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.limits.rules_path.is_none() {
            self.limits.rules.validate()?;
        }
        Ok(())
    }

    /// The retention horizon as a duration.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.cleanup.retention_hours))
    }
}
