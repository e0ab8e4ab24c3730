//! Recovery executor: retries rate-limited calls behind per-provider circuit breakers

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::backoff::BackoffCalculator;
use crate::circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitState};
use crate::classifier::{RateLimitClassifier, RateLimitDetails, RateLimitSignal};
use crate::config::{RecoveryConfig, RecoveryStrategy};
use crate::error::RecoveryError;
use crate::queue::{OperationContext, QueueProcessor, QueuedItemInfo, RetryHandle, SweepReport};
use crate::state::{ProviderKey, ProviderStateStore, ProviderStatus};

/// Callback invoked on every rate-limited attempt
pub type RateLimitCallback = Arc<dyn Fn(&RateLimitNotice<'_>) + Send + Sync>;

/// Per-call overrides of the process-wide recovery defaults
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub strategy: Option<RecoveryStrategy>,
    pub max_retries: Option<u32>,
    pub context: OperationContext,
    pub on_rate_limit: Option<RateLimitCallback>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Attach one diagnostic field
    pub fn context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn on_rate_limit(
        mut self,
        callback: impl Fn(&RateLimitNotice<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.on_rate_limit = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("strategy", &self.strategy)
            .field("max_retries", &self.max_retries)
            .field("context", &self.context)
            .field("on_rate_limit", &self.on_rate_limit.is_some())
            .finish()
    }
}

/// What the caller learns about a rate-limited attempt
#[derive(Debug)]
pub struct RateLimitNotice<'a> {
    pub provider: &'a ProviderKey,
    pub attempt: u32,
    pub strategy: RecoveryStrategy,
    pub details: &'a RateLimitDetails,
    /// Backoff before the next attempt; `None` when the budget is spent
    pub next_delay: Option<Duration>,
    pub context: &'a OperationContext,
}

/// Rate-limit recovery orchestrator.
///
/// Owns the provider state store and the policies acting on it. Construct one
/// per process and pass it where needed; [`crate::global_recovery_system`] is
/// a convenience for call sites without explicit wiring.
pub struct RecoverySystem {
    config: Arc<RecoveryConfig>,
    store: ProviderStateStore,
    breaker: CircuitBreaker,
    backoff: BackoffCalculator,
    classifier: RateLimitClassifier,
    queue: QueueProcessor,
}

impl RecoverySystem {
    pub fn new(config: RecoveryConfig) -> Self {
        let breaker = CircuitBreaker::from_config(&config);
        let backoff = BackoffCalculator::from_config(&config);
        let classifier = RateLimitClassifier::new(config.base_delay);
        let config = Arc::new(config);
        let queue = QueueProcessor::new(
            config.clone(),
            breaker.clone(),
            backoff.clone(),
            classifier.clone(),
        );

        Self {
            config,
            store: ProviderStateStore::new(),
            breaker,
            backoff,
            classifier,
            queue,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RecoveryConfig::default())
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn backoff(&self) -> &BackoffCalculator {
        &self.backoff
    }

    pub fn classifier(&self) -> &RateLimitClassifier {
        &self.classifier
    }

    /// Execute an operation with default options
    pub async fn execute<F, Fut, T, E>(
        &self,
        provider: impl Into<ProviderKey>,
        operation: F,
    ) -> Result<T, RecoveryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RateLimitSignal,
    {
        self.execute_with_recovery(provider, operation, ExecuteOptions::default())
            .await
    }

    /// Execute an operation, backing off and retrying while it is rate limited
    pub async fn execute_with_recovery<F, Fut, T, E>(
        &self,
        provider: impl Into<ProviderKey>,
        mut operation: F,
        options: ExecuteOptions,
    ) -> Result<T, RecoveryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RateLimitSignal,
    {
        self.execute_with_context(provider, |_attempt| operation(), options)
            .await
    }

    /// Execute an operation that receives its 0-based attempt number.
    ///
    /// The circuit is checked once, before the first attempt. Only rate-limit
    /// failures are retried; any other failure is returned immediately as
    /// [`RecoveryError::Operation`]. Every failed attempt counts once towards
    /// opening the circuit.
    pub async fn execute_with_context<F, Fut, T, E>(
        &self,
        provider: impl Into<ProviderKey>,
        mut operation: F,
        options: ExecuteOptions,
    ) -> Result<T, RecoveryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RateLimitSignal,
    {
        let provider = provider.into();
        let entry = self.store.entry(&provider);
        let strategy = options.strategy.unwrap_or(self.config.default_strategy);
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);

        let _permit = CircuitPermit::acquire(&entry, &self.breaker).map_err(|rejection| {
            warn!("Circuit breaker is open for provider {}, rejecting call", provider);
            RecoveryError::CircuitBreakerOpen {
                provider: provider.clone(),
                retry_in: rejection.retry_in,
            }
        })?;

        let mut attempt = 0;

        loop {
            debug!(
                "Executing attempt {} of {} for provider {}",
                attempt + 1,
                max_retries + 1,
                provider
            );
            entry.with_state(|state| state.metrics.total_calls += 1);

            let error = match operation(attempt).await {
                Ok(result) => {
                    entry.with_state(|state| self.breaker.record_success(state));
                    if attempt > 0 {
                        info!(
                            "Operation for provider {} succeeded after {} attempts",
                            provider,
                            attempt + 1
                        );
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            if !self.classifier.is_rate_limit_error(&error) {
                entry.with_state(|state| self.breaker.record_failure(state));
                warn!(
                    "Operation for provider {} failed with non-rate-limit error: {}",
                    provider, error
                );
                return Err(RecoveryError::Operation { provider, error });
            }

            let details = self.classifier.extract_details(&provider, &error);
            entry.with_state(|state| {
                state.metrics.total_rate_limited += 1;
                state.record_quota(details.remaining, details.limit, details.reset_at);
                self.breaker.record_failure(state);
            });

            let next_delay = (attempt < max_retries)
                .then(|| self.backoff.compute_delay(attempt, Some(details.retry_after)));

            self.apply_strategy(&RateLimitNotice {
                provider: &provider,
                attempt,
                strategy,
                details: &details,
                next_delay,
                context: &options.context,
            }, &options);

            let Some(delay) = next_delay else {
                warn!(
                    "Operation for provider {} still rate limited after {} attempts: {}",
                    provider,
                    attempt + 1,
                    error
                );
                return Err(RecoveryError::MaxRetriesExceeded {
                    provider,
                    attempts: attempt + 1,
                    last_error: error,
                });
            };

            warn!(
                "Provider {} rate limited on attempt {}: {}. Retrying in {:?}",
                provider,
                attempt + 1,
                error,
                delay
            );
            entry.with_state(|state| state.metrics.total_retries += 1);
            sleep(delay).await;
            attempt += 1;
        }
    }

    fn apply_strategy(&self, notice: &RateLimitNotice<'_>, options: &ExecuteOptions) {
        match notice.strategy {
            RecoveryStrategy::Wait => debug!(
                "Provider {} rate limited, waiting out the backoff",
                notice.provider
            ),
            RecoveryStrategy::ReduceBatch => info!(
                "Provider {} rate limited, caller should reduce its batch size",
                notice.provider
            ),
            RecoveryStrategy::UseCache => info!(
                "Provider {} rate limited, caller should fall back to cached data",
                notice.provider
            ),
            RecoveryStrategy::Skip => info!(
                "Provider {} rate limited, caller may skip this operation",
                notice.provider
            ),
        }

        if let Some(callback) = &options.on_rate_limit {
            callback(notice);
        }
    }

    /// Queue an operation for out-of-band replay by the provider's worker
    pub fn queue_for_retry<F, Fut, T, E>(
        &self,
        provider: impl Into<ProviderKey>,
        operation: F,
        context: OperationContext,
    ) -> Result<RetryHandle<T, E>, RecoveryError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: RateLimitSignal + Send + 'static,
    {
        let entry = self.store.entry(&provider.into());
        self.queue.enqueue(&entry, operation, context)
    }

    /// Run one queue sweep for a provider now, independent of its worker
    pub async fn sweep_queue(&self, provider: impl Into<ProviderKey>) -> SweepReport {
        let entry = self.store.entry(&provider.into());
        self.queue.sweep(&entry).await
    }

    /// Drop a provider's queued items, settling their handles as cancelled
    pub fn clear_queue(&self, provider: impl Into<ProviderKey>) -> usize {
        match self.store.get(&provider.into()) {
            Some(entry) => self.queue.clear(&entry),
            None => 0,
        }
    }

    pub fn queue_len(&self, provider: impl Into<ProviderKey>) -> usize {
        self.store
            .get(&provider.into())
            .map(|entry| entry.with_state(|state| state.retry_queue.len()))
            .unwrap_or(0)
    }

    pub fn queued_items(&self, provider: impl Into<ProviderKey>) -> Vec<QueuedItemInfo> {
        self.store
            .get(&provider.into())
            .map(|entry| {
                entry.with_state(|state| state.retry_queue.iter().map(|item| item.info()).collect())
            })
            .unwrap_or_default()
    }

    /// Whether a background worker is currently draining the provider's queue
    pub fn has_active_worker(&self, provider: impl Into<ProviderKey>) -> bool {
        self.store
            .get(&provider.into())
            .map(|entry| entry.with_state(|state| state.worker_active()))
            .unwrap_or(false)
    }

    /// Record a quota snapshot observed outside a failure, e.g. from response headers
    pub fn update_rate_limit_info(
        &self,
        provider: impl Into<ProviderKey>,
        remaining: u64,
        limit: u64,
        reset_at: Option<DateTime<Utc>>,
    ) {
        let provider = provider.into();
        let entry = self.store.entry(&provider);
        entry.with_state(|state| {
            state.record_quota(Some(remaining), Some(limit), reset_at);
            self.breaker.observe_quota(state);
        });
        debug!(
            "Provider {} quota updated: {}/{} remaining",
            provider, remaining, limit
        );
    }

    /// Current circuit phase of a provider, with the open timer applied
    pub fn circuit_state(&self, provider: impl Into<ProviderKey>) -> CircuitState {
        self.store
            .get(&provider.into())
            .map(|entry| entry.with_state(|state| self.breaker.state(state)))
            .unwrap_or(CircuitState::Closed)
    }

    pub fn failure_count(&self, provider: impl Into<ProviderKey>) -> u32 {
        self.store
            .get(&provider.into())
            .map(|entry| entry.with_state(|state| state.failure_count))
            .unwrap_or(0)
    }

    pub fn provider_status(&self, provider: impl Into<ProviderKey>) -> Option<ProviderStatus> {
        let entry = self.store.get(&provider.into())?;
        Some(self.status_of(&entry))
    }

    pub fn all_provider_statuses(&self) -> Vec<ProviderStatus> {
        let mut statuses: Vec<_> = self
            .store
            .entries()
            .iter()
            .map(|entry| self.status_of(entry))
            .collect();
        statuses.sort_by(|a, b| a.provider.cmp(&b.provider));
        statuses
    }

    fn status_of(&self, entry: &crate::state::ProviderEntry) -> ProviderStatus {
        entry.with_state(|state| ProviderStatus {
            provider: entry.key().clone(),
            circuit: self.breaker.state(state),
            failure_count: state.failure_count,
            remaining: state.remaining,
            limit: state.limit,
            reset_at: state.reset_at,
            last_failure_at: state.last_failure_at,
            queue_len: state.retry_queue.len(),
            in_flight: state.in_flight,
            worker_active: state.worker_active(),
            metrics: state.metrics.clone(),
        })
    }

    /// Stop every queue worker and cancel all queued operations
    pub fn shutdown(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.store.entries() {
            self.queue.stop_worker(&entry);
            cancelled += self.queue.clear(&entry);
        }
        info!(
            "Recovery system shut down, {} queued operations cancelled",
            cancelled
        );
        cancelled
    }
}

impl Default for RecoverySystem {
    fn default() -> Self {
        Self::with_defaults()
    }
}
