//! Recovery configuration

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How a rate-limited call should be handled, as signalled to the caller.
///
/// The executor always backs off and retries; the non-`Wait` strategies are
/// hints delivered through logging and [`crate::RateLimitNotice`] so that the
/// caller can adapt the next attempt (smaller page, cached data, skipping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Rely purely on the backoff delay
    #[default]
    Wait,
    /// Ask the caller to shrink its batch size
    ReduceBatch,
    /// Ask the caller to serve cached data
    UseCache,
    /// Ask the caller to skip the work
    Skip,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Wait => "wait",
            RecoveryStrategy::ReduceBatch => "reduce_batch",
            RecoveryStrategy::UseCache => "use_cache",
            RecoveryStrategy::Skip => "skip",
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "wait" => Ok(RecoveryStrategy::Wait),
            "reduce_batch" => Ok(RecoveryStrategy::ReduceBatch),
            "use_cache" => Ok(RecoveryStrategy::UseCache),
            "skip" => Ok(RecoveryStrategy::Skip),
            _ => Err(format!("Invalid recovery strategy: {}", s)),
        }
    }
}

/// Process-wide recovery defaults, overridable per call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Base delay of the exponential backoff
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound of the backoff delay before jitter
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Retries after the first attempt (attempts run from 0 to `max_retries` inclusive)
    pub max_retries: u32,

    /// Share of the delay added as random jitter, between 0 and 1
    pub jitter_fraction: f64,

    /// Consecutive failures before the circuit opens
    pub circuit_breaker_threshold: u32,

    /// Time the circuit stays open before moving to half-open
    #[serde(with = "humantime_serde")]
    pub circuit_breaker_timeout: Duration,

    /// Concurrent calls admitted while the circuit is half-open
    pub half_open_max_calls: u32,

    /// Strategy signalled when a call does not override it
    pub default_strategy: RecoveryStrategy,

    /// Whether queued operations are replayed by background workers
    pub enable_queue_processing: bool,

    /// Capacity of each provider's retry queue
    pub max_queue_size: usize,

    /// Fixed period of the per-provider queue sweep
    #[serde(with = "humantime_serde")]
    pub queue_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_retries: 5,
            jitter_fraction: 0.3,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            default_strategy: RecoveryStrategy::Wait,
            enable_queue_processing: true,
            max_queue_size: 1000,
            queue_interval: Duration::from_secs(1),
        }
    }
}

impl RecoveryConfig {
    pub fn builder() -> RecoveryConfigBuilder {
        RecoveryConfigBuilder::new()
    }
}

/// Builder for recovery configuration
pub struct RecoveryConfigBuilder {
    config: RecoveryConfig,
}

impl RecoveryConfigBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: RecoveryConfig::default(),
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.config.jitter_fraction = fraction;
        self
    }

    /// Set failure threshold
    pub fn circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker_threshold = threshold;
        self
    }

    /// Set how long an open circuit waits before probing
    pub fn circuit_breaker_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker_timeout = timeout;
        self
    }

    pub fn half_open_max_calls(mut self, calls: u32) -> Self {
        self.config.half_open_max_calls = calls;
        self
    }

    pub fn default_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.config.default_strategy = strategy;
        self
    }

    pub fn enable_queue_processing(mut self, enabled: bool) -> Self {
        self.config.enable_queue_processing = enabled;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    pub fn queue_interval(mut self, interval: Duration) -> Self {
        self.config.queue_interval = interval;
        self
    }

    pub fn build(self) -> RecoveryConfig {
        self.config
    }
}

impl Default for RecoveryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_defaults() {
        let config = RecoveryConfig::default();

        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(300));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.jitter_fraction, 0.3);
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.circuit_breaker_timeout, Duration::from_secs(60));
        assert_eq!(config.default_strategy, RecoveryStrategy::Wait);
        assert!(config.enable_queue_processing);
        assert_eq!(config.max_queue_size, 1000);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("wait".parse::<RecoveryStrategy>(), Ok(RecoveryStrategy::Wait));
        assert_eq!("reduce-batch".parse::<RecoveryStrategy>(), Ok(RecoveryStrategy::ReduceBatch));
        assert_eq!("USE_CACHE".parse::<RecoveryStrategy>(), Ok(RecoveryStrategy::UseCache));
        assert!("later".parse::<RecoveryStrategy>().is_err());
        assert_eq!(RecoveryStrategy::Skip.to_string(), "skip");
    }

    #[test]
    fn test_humantime_round_trip() {
        let config = RecoveryConfig::builder()
            .base_delay(Duration::from_millis(250))
            .circuit_breaker_timeout(Duration::from_secs(90))
            .build();

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["base_delay"], "250ms");
        assert_eq!(json["circuit_breaker_timeout"], "1m 30s");
        assert_eq!(json["default_strategy"], "wait");

        let parsed: RecoveryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.base_delay, Duration::from_millis(250));
    }
}
