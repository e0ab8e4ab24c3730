//! Logging setup for Backstop
//!
//! The libraries log through the `log` facade; this crate installs a
//! `tracing-subscriber` formatter that also collects those records.

pub mod config;
pub mod init;

pub use config::{LogFormat, LogLevel, LoggingConfig};
pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing, validate_filter};

use once_cell::sync::OnceCell;

static ACTIVE_CONFIG: OnceCell<LoggingConfig> = OnceCell::new();

/// The configuration the global subscriber was installed with, if any
pub fn active_config() -> Option<&'static LoggingConfig> {
    ACTIVE_CONFIG.get()
}
