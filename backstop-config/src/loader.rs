//! Configuration loading and environment variable handling

use crate::domains::BackstopConfig;
use crate::error::{ConfigError, ConfigResult};
use backstop_logging::{LogFormat, LogLevel, LoggingConfig};
use backstop_resilience::{RecoveryConfig, RecoveryStrategy};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "BACKSTOP".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<BackstopConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: BackstopConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<BackstopConfig> {
        let mut config = BackstopConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<BackstopConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut BackstopConfig) -> ConfigResult<()> {
        self.apply_recovery_overrides(&mut config.recovery)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply recovery config overrides
    fn apply_recovery_overrides(&self, config: &mut RecoveryConfig) -> ConfigResult<()> {
        if let Some(ms) = self.parse_env_var::<u64>("BASE_DELAY_MS")? {
            config.base_delay = Duration::from_millis(ms);
        }

        if let Some(ms) = self.parse_env_var::<u64>("MAX_DELAY_MS")? {
            config.max_delay = Duration::from_millis(ms);
        }

        if let Some(retries) = self.parse_env_var("MAX_RETRIES")? {
            config.max_retries = retries;
        }

        if let Some(jitter) = self.parse_env_var("JITTER")? {
            config.jitter_fraction = jitter;
        }

        if let Some(threshold) = self.parse_env_var("CIRCUIT_THRESHOLD")? {
            config.circuit_breaker_threshold = threshold;
        }

        if let Some(ms) = self.parse_env_var::<u64>("CIRCUIT_TIMEOUT_MS")? {
            config.circuit_breaker_timeout = Duration::from_millis(ms);
        }

        if let Ok(strategy) = self.get_env_var("DEFAULT_STRATEGY") {
            config.default_strategy = RecoveryStrategy::from_str(&strategy).map_err(|_| {
                ConfigError::EnvError(format!("Invalid DEFAULT_STRATEGY: {}", strategy))
            })?;
        }

        if let Some(enabled) = self.parse_env_var("QUEUE_PROCESSING")? {
            config.enable_queue_processing = enabled;
        }

        if let Some(size) = self.parse_env_var("MAX_QUEUE_SIZE")? {
            config.max_queue_size = size;
        }

        if let Some(ms) = self.parse_env_var::<u64>("QUEUE_INTERVAL_MS")? {
            config.queue_interval = Duration::from_millis(ms);
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Parse an optional prefixed variable
    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
