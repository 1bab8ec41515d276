//! Configuration Loading System
//!
//! Sources are applied in the order they were added, later ones winning:
//! 1. Default values
//! 2. Configuration file or in-memory TOML
//! 3. Environment variables

use crate::{ConfigError, Result};
use helix_pool::{PoolConfig, StrategyKind};
use helix_telemetry::{LogConfig, LogOutput};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Configuration source type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Load from a file
    File(PathBuf),
    /// Load from environment variables
    Env,
    /// Use default values
    Default,
    /// Load from in-memory string (for testing)
    Memory(String),
}

/// Top-level Helix configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HelixConfig {
    /// Scheduler, cache and device inventory
    pub pool: PoolConfig,
    /// Logging configuration
    pub log: LogConfig,
}

impl HelixConfig {
    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Configuration loader
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: vec![ConfigSource::Default],
            env_prefix: None,
        }
    }

    /// Add a file source
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add an in-memory TOML source
    pub fn with_toml(mut self, content: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Memory(content.into()));
        self
    }

    /// Add environment variable source with prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.sources.push(ConfigSource::Env);
        self
    }

    /// Load configuration from all sources
    pub fn load(&self) -> Result<HelixConfig> {
        let mut config = HelixConfig::default();

        for source in &self.sources {
            match source {
                ConfigSource::Default => {}
                ConfigSource::File(path) => {
                    let path = Self::expand_path(path);
                    let content = std::fs::read_to_string(&path)?;
                    config = Self::parse(&content)?;
                }
                ConfigSource::Env => {
                    if let Some(prefix) = &self.env_prefix {
                        config = Self::apply_env_overrides(config, prefix)?;
                    }
                }
                ConfigSource::Memory(content) => {
                    config = Self::parse(content)?;
                }
            }
        }

        Ok(Self::normalize(config))
    }

    /// Load configuration from a TOML string
    pub fn load_from_str(toml: &str) -> Result<HelixConfig> {
        Self::parse(toml).map(Self::normalize)
    }

    /// Get default configuration
    #[must_use]
    pub fn default_config() -> HelixConfig {
        HelixConfig::default()
    }

    fn parse(content: &str) -> Result<HelixConfig> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Fill unnamed devices and expand log paths
    fn normalize(mut config: HelixConfig) -> HelixConfig {
        for device in &mut config.pool.devices {
            if device.name.is_empty() {
                device.name.clone_from(&device.id);
            }
        }
        config.log.output = match config.log.output {
            LogOutput::File(path) => LogOutput::File(Self::expand_path(&path)),
            LogOutput::Both { stdout, file } => LogOutput::Both {
                stdout,
                file: Self::expand_path(&file),
            },
            other => other,
        };
        config
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: HelixConfig, prefix: &str) -> Result<HelixConfig> {
        let pool = &mut config.pool;
        if let Some(val) = env_parsed(prefix, "POOL_WORKER_COUNT")? {
            pool.worker_count = val;
        }
        if let Some(val) = env_parsed(prefix, "POOL_QUEUE_CAPACITY")? {
            pool.queue_capacity = val;
        }
        if let Some(val) = env_parsed(prefix, "POOL_JOB_TIMEOUT_MS")? {
            pool.job_timeout_ms = val;
        }
        if let Some(val) = env_parsed(prefix, "POOL_MAX_INPUT_LEN")? {
            pool.max_input_len = val;
        }
        if let Some(val) = env_parsed(prefix, "POOL_IDLE_THRESHOLD_SECS")? {
            pool.idle_threshold_secs = val;
        }
        if let Some(val) = env_parsed(prefix, "POOL_RECLAIM_INTERVAL_SECS")? {
            pool.reclaim_interval_secs = val;
        }
        if let Some(val) = env_parsed(prefix, "POOL_PRELOAD_ENABLED")? {
            pool.preload_enabled = val;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_POOL_PRIMARY_STRATEGY")) {
            pool.primary_strategy = parse_strategy(&val)?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_POOL_FALLBACK_STRATEGY")) {
            pool.fallback_strategy = match val.trim().to_lowercase().as_str() {
                "" | "none" => None,
                _ => Some(parse_strategy(&val)?),
            };
        }

        // Log overrides
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_LEVEL")) {
            config.log.level = val
                .parse()
                .map_err(|_| ConfigError::EnvVar(format!("Invalid log level value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_FORMAT")) {
            config.log.format = val
                .parse()
                .map_err(|_| ConfigError::EnvVar(format!("Invalid log format value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_FILE_PATH")) {
            config.log.output = LogOutput::File(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Expand path with tilde
    fn expand_path(path: &Path) -> PathBuf {
        if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        path.to_path_buf()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parsed<T: FromStr>(prefix: &str, key: &str) -> Result<Option<T>> {
    match std::env::var(format!("{prefix}_{key}")) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVar(format!("Invalid {} value: {val}", key.to_lowercase()))),
        Err(_) => Ok(None),
    }
}

fn parse_strategy(val: &str) -> Result<StrategyKind> {
    val.parse()
        .map_err(|e: helix_pool::PoolError| ConfigError::EnvVar(e.to_string()))
}
