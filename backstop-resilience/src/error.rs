//! Recovery error types

use std::time::Duration;
use uuid::Uuid;

use crate::state::ProviderKey;

/// Outcome of a call that did not produce the operation's value.
///
/// `E` is the wrapped operation's native error type.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError<E> {
    /// The provider's circuit is open; the operation was not invoked
    #[error("Circuit breaker is open for provider {provider}")]
    CircuitBreakerOpen {
        provider: ProviderKey,
        retry_in: Option<Duration>,
    },

    /// A rate-limited operation used up its attempt budget
    #[error("Maximum retry attempts ({attempts}) exceeded for provider {provider}. Last error: {last_error}")]
    MaxRetriesExceeded {
        provider: ProviderKey,
        attempts: u32,
        last_error: E,
    },

    /// The provider's retry queue is at capacity
    #[error("Retry queue for provider {provider} is full ({capacity} items)")]
    QueueFull { provider: ProviderKey, capacity: usize },

    /// A failure that is not a rate limit, passed through untouched
    #[error("Operation against provider {provider} failed: {error}")]
    Operation { provider: ProviderKey, error: E },

    /// A queued operation was dropped before it settled
    #[error("Queued operation {id} for provider {provider} was cancelled")]
    Cancelled { provider: ProviderKey, id: Uuid },
}

impl<E> RecoveryError<E> {
    pub fn provider(&self) -> &ProviderKey {
        match self {
            RecoveryError::CircuitBreakerOpen { provider, .. }
            | RecoveryError::MaxRetriesExceeded { provider, .. }
            | RecoveryError::QueueFull { provider, .. }
            | RecoveryError::Operation { provider, .. }
            | RecoveryError::Cancelled { provider, .. } => provider,
        }
    }

    /// Get the underlying error if present
    pub fn into_inner(self) -> Option<E> {
        match self {
            RecoveryError::MaxRetriesExceeded { last_error, .. } => Some(last_error),
            RecoveryError::Operation { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Borrow the underlying error if present
    pub fn inner(&self) -> Option<&E> {
        match self {
            RecoveryError::MaxRetriesExceeded { last_error, .. } => Some(last_error),
            RecoveryError::Operation { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Check if this represents a circuit breaker open error
    pub fn is_circuit_breaker_open(&self) -> bool {
        matches!(self, RecoveryError::CircuitBreakerOpen { .. })
    }

    pub fn is_max_retries_exceeded(&self) -> bool {
        matches!(self, RecoveryError::MaxRetriesExceeded { .. })
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, RecoveryError::QueueFull { .. })
    }

    /// Whether the caller should treat this as "try again later"
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            RecoveryError::CircuitBreakerOpen { .. } | RecoveryError::QueueFull { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_provider() {
        let error: RecoveryError<String> = RecoveryError::MaxRetriesExceeded {
            provider: ProviderKey::from("linear"),
            attempts: 3,
            last_error: "429 Too Many Requests".to_string(),
        };

        assert_eq!(
            error.to_string(),
            "Maximum retry attempts (3) exceeded for provider linear. Last error: 429 Too Many Requests"
        );
        assert_eq!(error.provider().as_str(), "linear");
        assert_eq!(error.into_inner().as_deref(), Some("429 Too Many Requests"));
    }

    #[test]
    fn test_backpressure_classification() {
        let open: RecoveryError<String> = RecoveryError::CircuitBreakerOpen {
            provider: ProviderKey::from("notion"),
            retry_in: None,
        };
        let full: RecoveryError<String> = RecoveryError::QueueFull {
            provider: ProviderKey::from("notion"),
            capacity: 10,
        };
        let failed: RecoveryError<String> = RecoveryError::Operation {
            provider: ProviderKey::from("notion"),
            error: "boom".to_string(),
        };

        assert!(open.is_backpressure() && open.is_circuit_breaker_open());
        assert!(full.is_backpressure() && full.is_queue_full());
        assert!(!failed.is_backpressure());
        assert!(open.into_inner().is_none());
    }
}
