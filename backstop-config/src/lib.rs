//! Domain-driven configuration management for Backstop
//!
//! Configuration is split by functional domain, each with its own
//! validation, defaults, and environment variable overrides.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use backstop_logging::{LogFormat, LogLevel, LoggingConfig};
pub use backstop_resilience::{RecoveryConfig, RecoveryStrategy};
pub use domains::BackstopConfig;
