//! Logging configuration validation

use crate::error::ConfigResult;
use crate::validation::Validatable;
use backstop_logging::LoggingConfig;

impl Validatable for LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.directives.iter().any(|d| d.trim().is_empty()) {
            return Err(self.validation_error("Log filter directives cannot be empty"));
        }

        backstop_logging::validate_filter(self)
            .map_err(|e| self.validation_error(format!("{:#}", e)))
    }

    fn domain_name(&self) -> &'static str {
        "logging"
    }
}
