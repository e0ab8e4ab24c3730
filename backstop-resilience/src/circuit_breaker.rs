//! Circuit breaker pattern implementation
//!
//! The breaker is a policy object: the phase, timers and counters it acts on
//! live in each provider's [`ProviderRateLimitState`], so one breaker serves
//! every provider while their states stay disjoint.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RecoveryConfig;
use crate::state::{ProviderEntry, ProviderRateLimitState};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, limited requests allowed to test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Why a call was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// Time left before the circuit turns half-open, when known
    pub retry_in: Option<Duration>,
}

/// Circuit breaker policy shared by all providers
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout: Duration,
    half_open_max_calls: u32,
}

impl CircuitBreaker {
    /// Create a new circuit breaker policy
    pub fn new(failure_threshold: u32, timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            timeout,
            half_open_max_calls: half_open_max_calls.max(1),
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_timeout,
            config.half_open_max_calls,
        )
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get the current state, applying the open timer first
    pub fn state(&self, state: &mut ProviderRateLimitState) -> CircuitState {
        self.update_state(state);
        state.circuit
    }

    /// Check if the circuit breaker is open (requests should be blocked)
    pub fn is_open(&self, state: &mut ProviderRateLimitState) -> bool {
        self.state(state) == CircuitState::Open
    }

    /// Decide whether a call may proceed.
    ///
    /// Half-open admissions take a probe slot that must be handed back with
    /// [`CircuitBreaker::release_probe`]; the returned flag says whether one was taken.
    pub fn try_acquire(&self, state: &mut ProviderRateLimitState) -> Result<bool, Rejection> {
        self.update_state(state);

        match state.circuit {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if state.half_open_in_flight < self.half_open_max_calls => {
                state.half_open_in_flight += 1;
                Ok(true)
            }
            CircuitState::HalfOpen => {
                state.metrics.total_rejected += 1;
                Err(Rejection { retry_in: None })
            }
            CircuitState::Open => {
                state.metrics.total_rejected += 1;
                let retry_in = state
                    .opened_at
                    .map(|opened| self.timeout.saturating_sub(opened.elapsed()));
                Err(Rejection { retry_in })
            }
        }
    }

    pub fn release_probe(&self, state: &mut ProviderRateLimitState) {
        state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
    }

    /// Record a successful operation
    pub fn record_success(&self, state: &mut ProviderRateLimitState) {
        self.update_state(state);
        state.metrics.total_successes += 1;

        match state.circuit {
            CircuitState::Closed | CircuitState::HalfOpen => self.reset(state),
            CircuitState::Open => {
                // A call admitted before the circuit opened; the open timer still governs
                log::debug!("Ignoring late success while circuit is open");
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self, state: &mut ProviderRateLimitState) {
        self.update_state(state);

        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(Utc::now());
        state.metrics.total_failures += 1;

        match state.circuit {
            CircuitState::Closed => {
                if state.failure_count >= self.failure_threshold {
                    self.transition_to_open(state);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open(state);
            }
            CircuitState::Open => {
                // Already open, no action needed
            }
        }
    }

    /// Apply an external quota observation; a healthy quota closes the circuit
    pub fn observe_quota(&self, state: &mut ProviderRateLimitState) {
        self.update_state(state);

        if state.quota_is_healthy() && state.circuit != CircuitState::Open {
            self.reset(state);
        }
    }

    // Internal methods

    fn update_state(&self, state: &mut ProviderRateLimitState) {
        if state.circuit == CircuitState::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= self.timeout {
                    self.transition_to_half_open(state);
                }
            }
        }
    }

    fn reset(&self, state: &mut ProviderRateLimitState) {
        state.failure_count = 0;
        if state.circuit != CircuitState::Closed {
            self.transition_to_closed(state);
        }
    }

    fn transition_to_open(&self, state: &mut ProviderRateLimitState) {
        state.circuit = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        log::warn!(
            "Circuit breaker opened after {} consecutive failures, cooling down for {:?}",
            state.failure_count,
            self.timeout
        );
    }

    fn transition_to_closed(&self, state: &mut ProviderRateLimitState) {
        state.circuit = CircuitState::Closed;
        state.opened_at = None;
        log::info!("Circuit breaker closed after successful recovery");
    }

    fn transition_to_half_open(&self, state: &mut ProviderRateLimitState) {
        state.circuit = CircuitState::HalfOpen;
        log::info!("Circuit breaker transitioned to half-open state");
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

/// Admission to call a provider, holding a half-open probe slot when one was taken
pub struct CircuitPermit {
    probe: Option<(Arc<ProviderEntry>, CircuitBreaker)>,
}

impl CircuitPermit {
    /// Check the circuit of `entry` and admit or reject a call
    pub fn acquire(entry: &Arc<ProviderEntry>, breaker: &CircuitBreaker) -> Result<Self, Rejection> {
        let probing = entry.with_state(|state| breaker.try_acquire(state))?;

        Ok(Self {
            probe: probing.then(|| (entry.clone(), breaker.clone())),
        })
    }

    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if let Some((entry, breaker)) = self.probe.take() {
            entry.with_state(|state| breaker.release_probe(state));
        }
    }
}
