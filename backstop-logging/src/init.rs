//! Subscriber initialisation from a logging configuration

use super::{LogFormat, LoggingConfig, ACTIVE_CONFIG};
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Build the event filter for a configuration.
///
/// `RUST_LOG` takes over when the configured directives do not parse.
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = config.filter_string();
    EnvFilter::try_new(&directives)
        .or_else(|_| EnvFilter::try_from_default_env())
        .with_context(|| format!("Invalid log filter '{}'", directives))
}

/// Check that the configured directives parse, without consulting `RUST_LOG`
pub fn validate_filter(config: &LoggingConfig) -> Result<()> {
    let directives = config.filter_string();
    EnvFilter::try_new(&directives)
        .map(|_| ())
        .with_context(|| format!("Invalid log filter '{}'", directives))
}

/// Initialize logging from configuration
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_env_filter(config)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    // try_init also routes `log` records into tracing
    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Text => builder.try_init(),
    };

    match result {
        Ok(()) => {
            let _ = ACTIVE_CONFIG.set(config.clone());
            tracing::debug!(
                "Logging initialized at level {} with {:?} format",
                config.level,
                config.format
            );
        }
        Err(_) => tracing::debug!("Global tracing subscriber already initialized, skipping"),
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}
