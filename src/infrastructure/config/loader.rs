use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid batch_size: {0}. Must be at least 1")]
    InvalidBatchSize(usize),

    #[error("Invalid max_concurrent_lookups: {0}. Must be at least 1")]
    InvalidConcurrency(usize),

    #[error("Invalid {field}: must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("Retry schedule cannot be empty")]
    EmptyRetrySchedule,

    #[error("Retry delays must be non-decreasing: {0:?}")]
    UnsortedRetrySchedule(Vec<u64>),

    #[error("Invalid max_attempts: {attempts}. Must match the retry schedule length ({delays})")]
    RetryAttemptsMismatch { attempts: u32, delays: usize },

    #[error("Invalid burst_size: {0}. Must be at least 1 when rate limiting is enabled")]
    InvalidBurstSize(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .namecache/config.yaml
    /// 3. .namecache/local.yaml (optional local overrides)
    /// 4. Environment variables (NAMECACHE_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".namecache/config.yaml"))
            .merge(Yaml::file(".namecache/local.yaml"))
            .merge(Env::prefixed("NAMECACHE_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, with env overrides on top
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("NAMECACHE_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let requests = &config.requests;
        if requests.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(requests.batch_size));
        }
        if requests.max_concurrent_lookups == 0 {
            return Err(ConfigError::InvalidConcurrency(requests.max_concurrent_lookups));
        }
        for (field, value) in [
            ("batch_window_ms", requests.batch_window_ms),
            ("pending_timeout_secs", requests.pending_timeout_secs),
            ("sweep_interval_secs", requests.sweep_interval_secs),
            ("lookup_timeout_secs", requests.lookup_timeout_secs),
            ("refresh.interval_secs", config.refresh.interval_secs),
            ("refresh.nearby_timeout_ms", config.refresh.nearby_timeout_ms),
            ("persistence.flush_interval_secs", config.persistence.flush_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        let retry = &config.retry;
        if retry.delays_ms.is_empty() {
            return Err(ConfigError::EmptyRetrySchedule);
        }
        if retry.delays_ms.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::UnsortedRetrySchedule(retry.delays_ms.clone()));
        }
        if usize::try_from(retry.max_attempts).ok() != Some(retry.delays_ms.len()) {
            return Err(ConfigError::RetryAttemptsMismatch {
                attempts: retry.max_attempts,
                delays: retry.delays_ms.len(),
            });
        }

        if config.rate_limit.batches_per_second > 0 && config.rate_limit.burst_size == 0 {
            return Err(ConfigError::InvalidBurstSize(config.rate_limit.burst_size));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}
