//! Rate-limit recovery for calls into external APIs
//!
//! This crate wraps fallible calls to rate-limited providers with
//! exponential backoff, a per-provider circuit breaker and bounded,
//! background-drained retry queues.

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod queue;
pub mod recovery;
pub mod state;

// Re-export commonly used types
pub use backoff::BackoffCalculator;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use classifier::{ProviderError, RateLimitClassifier, RateLimitDetails, RateLimitSignal};
pub use config::{RecoveryConfig, RecoveryConfigBuilder, RecoveryStrategy};
pub use error::RecoveryError;
pub use queue::{OperationContext, QueuedItemInfo, RetryHandle, SweepReport};
pub use recovery::{ExecuteOptions, RateLimitCallback, RateLimitNotice, RecoverySystem};
pub use state::{ProviderKey, ProviderMetrics, ProviderStatus};

use once_cell::sync::OnceCell;
use std::sync::Arc;

static GLOBAL_RECOVERY: OnceCell<Arc<RecoverySystem>> = OnceCell::new();

/// Initialize the process-wide recovery system with a custom configuration
pub fn init_global_recovery_system(config: RecoveryConfig) -> Result<(), &'static str> {
    GLOBAL_RECOVERY
        .set(Arc::new(RecoverySystem::new(config)))
        .map_err(|_| "Recovery system already initialized")
}

/// Get the process-wide recovery system, creating it with defaults on first use
pub fn global_recovery_system() -> Arc<RecoverySystem> {
    GLOBAL_RECOVERY
        .get_or_init(|| Arc::new(RecoverySystem::with_defaults()))
        .clone()
}
