//! Domain-specific configuration modules

pub mod logging;
pub mod recovery;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use backstop_logging::LoggingConfig;
use backstop_resilience::RecoveryConfig;
use serde::{Deserialize, Serialize};

/// Main Backstop configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackstopConfig {
    /// Rate-limit recovery, circuit breaker and retry queue settings
    pub recovery: RecoveryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl BackstopConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.recovery.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = BackstopConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
