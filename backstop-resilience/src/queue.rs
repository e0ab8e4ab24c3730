//! Bounded per-provider retry queues and their background workers
//!
//! A queued operation and the caller's pending result are one unit: the item
//! owns the sending half of a one-shot channel and the caller awaits the
//! [`RetryHandle`] holding the other half. The handle settles exactly once,
//! with the value, with [`RecoveryError::MaxRetriesExceeded`] when the item
//! runs out of attempts, or with [`RecoveryError::Cancelled`] when the item is
//! dropped by [`crate::RecoverySystem::clear_queue`], by shutdown, or by a
//! sweep that is cancelled while the item's attempt is running.
//!
//! Each provider gets its own worker task, spawned on the first enqueue and
//! finishing once its queue drains.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::backoff::BackoffCalculator;
use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::{RateLimitClassifier, RateLimitDetails, RateLimitSignal};
use crate::config::RecoveryConfig;
use crate::error::RecoveryError;
use crate::state::{ProviderEntry, ProviderKey, ProviderRateLimitState};

/// Free-form diagnostic metadata supplied by the caller
pub type OperationContext = serde_json::Map<String, serde_json::Value>;

pub(crate) enum AttemptOutcome {
    Succeeded,
    Failed {
        message: String,
        rate_limit: Option<RateLimitDetails>,
    },
}

/// Type-erased deferred call together with the means to settle its caller
pub(crate) trait DeferredOperation: Send {
    fn attempt(&mut self) -> BoxFuture<'_, AttemptOutcome>;

    /// Settle the caller with the last error after `attempts` tries
    fn abandon(self: Box<Self>, attempts: u32);
}

struct Deferred<T, E, F> {
    id: Uuid,
    provider: ProviderKey,
    operation: F,
    classifier: RateLimitClassifier,
    last_error: Option<E>,
    settle: Option<oneshot::Sender<Result<T, RecoveryError<E>>>>,
}

impl<T, E, F, Fut> DeferredOperation for Deferred<T, E, F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: RateLimitSignal + Send,
{
    fn attempt(&mut self) -> BoxFuture<'_, AttemptOutcome> {
        Box::pin(async move {
            match (self.operation)().await {
                Ok(value) => {
                    if let Some(settle) = self.settle.take() {
                        if settle.send(Ok(value)).is_err() {
                            debug!("Caller for queued operation {} went away before it settled", self.id);
                        }
                    }
                    AttemptOutcome::Succeeded
                }
                Err(error) => {
                    let rate_limit = self
                        .classifier
                        .is_rate_limit_error(&error)
                        .then(|| self.classifier.extract_details(&self.provider, &error));
                    let message = error.to_string();
                    self.last_error = Some(error);
                    AttemptOutcome::Failed { message, rate_limit }
                }
            }
        })
    }

    fn abandon(mut self: Box<Self>, attempts: u32) {
        let Some(settle) = self.settle.take() else {
            return;
        };

        let outcome = match self.last_error.take() {
            Some(last_error) => RecoveryError::MaxRetriesExceeded {
                provider: self.provider.clone(),
                attempts,
                last_error,
            },
            None => RecoveryError::Cancelled {
                provider: self.provider.clone(),
                id: self.id,
            },
        };

        let _ = settle.send(Err(outcome));
    }
}

/// A deferred operation waiting in a provider's retry queue
pub struct RetryQueueItem {
    pub(crate) id: Uuid,
    pub(crate) attempt: u32,
    pub(crate) next_retry_at: Instant,
    pub(crate) last_error: Option<String>,
    pub(crate) context: OperationContext,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) operation: Box<dyn DeferredOperation>,
}

impl RetryQueueItem {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Diagnostic snapshot of this item
    pub fn info(&self) -> QueuedItemInfo {
        QueuedItemInfo {
            id: self.id,
            attempt: self.attempt,
            next_retry_in: self.next_retry_at.saturating_duration_since(Instant::now()),
            last_error: self.last_error.clone(),
            context: self.context.clone(),
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Diagnostic view of a queued item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItemInfo {
    pub id: Uuid,
    pub attempt: u32,
    #[serde(with = "humantime_serde")]
    pub next_retry_in: Duration,
    pub last_error: Option<String>,
    pub context: OperationContext,
    pub enqueued_at: DateTime<Utc>,
}

/// Pending result of a queued operation
pub struct RetryHandle<T, E> {
    id: Uuid,
    provider: ProviderKey,
    receiver: oneshot::Receiver<Result<T, RecoveryError<E>>>,
}

impl<T, E> RetryHandle<T, E> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn provider(&self) -> &ProviderKey {
        &self.provider
    }
}

impl<T, E> std::fmt::Debug for RetryHandle<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHandle")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .finish()
    }
}

impl<T, E> Future for RetryHandle<T, E> {
    type Output = Result<T, RecoveryError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RecoveryError::Cancelled {
                provider: self.provider.clone(),
                id: self.id,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// What one sweep over a provider's queue did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
    /// The sweep stopped early because the provider's circuit refused a call
    pub circuit_open: bool,
    /// Items left queued afterwards
    pub remaining: usize,
}

enum Admission<'a> {
    Admitted(RetryQueueItem, InFlightSlot<'a>),
    /// Settled or cleared since the sweep started
    Gone,
    Rejected,
}

/// Accounts for one item taken out of the queue by a sweep.
///
/// Dropping the slot without releasing it (sweep cancelled, worker aborted,
/// operation panicked) still returns the in-flight count and any half-open
/// probe; the item itself is dropped with the sweep and its handle settles
/// as cancelled.
struct InFlightSlot<'a> {
    entry: &'a Arc<ProviderEntry>,
    breaker: &'a CircuitBreaker,
    probe: bool,
    released: bool,
}

impl InFlightSlot<'_> {
    fn release(&mut self, state: &mut ProviderRateLimitState) {
        if self.released {
            return;
        }
        self.released = true;
        state.in_flight = state.in_flight.saturating_sub(1);
        if self.probe {
            self.breaker.release_probe(state);
        }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        if !self.released {
            debug!("Queued attempt for provider {} did not complete", self.entry.key());
            let entry = self.entry;
            entry.with_state(|state| self.release(state));
        }
    }
}

/// Enqueues deferred operations and replays them on a fixed interval
#[derive(Clone)]
pub(crate) struct QueueProcessor {
    config: Arc<RecoveryConfig>,
    breaker: CircuitBreaker,
    backoff: BackoffCalculator,
    classifier: RateLimitClassifier,
}

impl QueueProcessor {
    pub(crate) fn new(
        config: Arc<RecoveryConfig>,
        breaker: CircuitBreaker,
        backoff: BackoffCalculator,
        classifier: RateLimitClassifier,
    ) -> Self {
        Self {
            config,
            breaker,
            backoff,
            classifier,
        }
    }

    /// Append an operation to the provider's queue, arming its worker if idle
    pub(crate) fn enqueue<T, E, F, Fut>(
        &self,
        entry: &Arc<ProviderEntry>,
        operation: F,
        context: OperationContext,
    ) -> Result<RetryHandle<T, E>, RecoveryError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: RateLimitSignal + Send + 'static,
    {
        let provider = entry.key().clone();
        let capacity = self.config.max_queue_size;
        let id = Uuid::new_v4();
        let (settle, receiver) = oneshot::channel();

        let item = RetryQueueItem {
            id,
            attempt: 0,
            next_retry_at: Instant::now() + self.backoff.compute_delay(0, None),
            last_error: None,
            context,
            enqueued_at: Utc::now(),
            operation: Box::new(Deferred {
                id,
                provider: provider.clone(),
                operation,
                classifier: self.classifier.clone(),
                last_error: None,
                settle: Some(settle),
            }),
        };

        entry.with_state(|state| {
            if state.queue_occupancy() >= capacity {
                warn!(
                    "Retry queue for provider {} is full ({} items), rejecting operation",
                    provider, capacity
                );
                return Err(RecoveryError::QueueFull {
                    provider: provider.clone(),
                    capacity,
                });
            }

            state.retry_queue.push_back(item);
            state.metrics.total_enqueued += 1;
            debug!(
                "Queued operation {} for provider {} ({} queued)",
                id,
                provider,
                state.retry_queue.len()
            );

            if self.config.enable_queue_processing && !state.worker_active() {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        debug!("Starting retry queue worker for provider {}", provider);
                        state.worker = Some(runtime.spawn(self.clone().run_worker(entry.clone())));
                    }
                    Err(_) => warn!(
                        "No async runtime available, provider {} queue will only drain on manual sweeps",
                        provider
                    ),
                }
            }

            Ok(())
        })?;

        Ok(RetryHandle {
            id,
            provider,
            receiver,
        })
    }

    async fn run_worker(self, entry: Arc<ProviderEntry>) {
        let mut ticker = tokio::time::interval(self.config.queue_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.sweep(&entry).await;

            let drained = entry.with_state(|state| {
                if state.queue_occupancy() == 0 {
                    state.worker = None;
                    true
                } else {
                    false
                }
            });

            if drained {
                debug!("Retry queue for provider {} drained, stopping worker", entry.key());
                break;
            }
        }
    }

    /// Replay every due item once, in queue order.
    ///
    /// Each item is admitted through the circuit breaker like a direct call,
    /// so an open circuit or a spent half-open probe budget pauses the sweep
    /// and leaves the remaining items queued in place.
    pub(crate) async fn sweep(&self, entry: &Arc<ProviderEntry>) -> SweepReport {
        let mut report = SweepReport::default();

        let due: Vec<Uuid> = entry.with_state(|state| {
            let now = Instant::now();
            state
                .retry_queue
                .iter()
                .filter(|item| item.next_retry_at <= now)
                .map(|item| item.id)
                .collect()
        });

        for id in due {
            let (mut item, mut slot) = match self.admit(entry, id) {
                Admission::Admitted(item, slot) => (item, slot),
                Admission::Gone => continue,
                Admission::Rejected => {
                    debug!("Circuit for provider {} is not admitting calls, pausing queue sweep", entry.key());
                    report.circuit_open = true;
                    break;
                }
            };

            report.attempted += 1;
            let outcome = item.operation.attempt().await;

            let abandoned = entry.with_state(|state| {
                slot.release(state);

                match outcome {
                    AttemptOutcome::Succeeded => {
                        self.breaker.record_success(state);
                        report.succeeded += 1;
                        debug!("Queued operation {} for provider {} succeeded", item.id, entry.key());
                        None
                    }
                    AttemptOutcome::Failed { message, rate_limit } => {
                        if let Some(details) = &rate_limit {
                            state.metrics.total_rate_limited += 1;
                            state.record_quota(details.remaining, details.limit, details.reset_at);
                        }
                        self.breaker.record_failure(state);

                        item.attempt += 1;
                        item.last_error = Some(message);

                        if item.attempt >= self.config.max_retries {
                            state.metrics.total_abandoned += 1;
                            report.abandoned += 1;
                            Some(item)
                        } else {
                            let delay = self
                                .backoff
                                .compute_delay(item.attempt, rate_limit.map(|details| details.retry_after));
                            item.next_retry_at = Instant::now() + delay;
                            debug!(
                                "Queued operation {} for provider {} failed (attempt {}), next retry in {:?}",
                                item.id,
                                entry.key(),
                                item.attempt,
                                delay
                            );
                            state.retry_queue.push_back(item);
                            report.rescheduled += 1;
                            None
                        }
                    }
                }
            });

            if let Some(item) = abandoned {
                warn!(
                    "Queued operation {} for provider {} abandoned after {} attempts: {}",
                    item.id,
                    entry.key(),
                    item.attempt,
                    item.last_error.as_deref().unwrap_or("unknown error")
                );
                item.operation.abandon(item.attempt);
            }
        }

        report.remaining = entry.with_state(|state| state.retry_queue.len());
        if report.attempted > 0 {
            info!(
                "Swept retry queue for provider {}: {} attempted, {} succeeded, {} abandoned, {} remaining",
                entry.key(),
                report.attempted,
                report.succeeded,
                report.abandoned,
                report.remaining
            );
        }
        report
    }

    /// Take one queued item out for an attempt if the circuit admits a call
    fn admit<'a>(&'a self, entry: &'a Arc<ProviderEntry>, id: Uuid) -> Admission<'a> {
        entry.with_state(|state| {
            let Some(position) = state.retry_queue.iter().position(|item| item.id == id) else {
                return Admission::Gone;
            };

            let probe = match self.breaker.try_acquire(state) {
                Ok(probe) => probe,
                Err(_) => return Admission::Rejected,
            };

            match state.retry_queue.remove(position) {
                Some(item) => {
                    state.in_flight += 1;
                    state.metrics.total_calls += 1;
                    Admission::Admitted(
                        item,
                        InFlightSlot {
                            entry,
                            breaker: &self.breaker,
                            probe,
                            released: false,
                        },
                    )
                }
                None => {
                    if probe {
                        self.breaker.release_probe(state);
                    }
                    Admission::Gone
                }
            }
        })
    }

    /// Drop every queued item; their handles settle as cancelled
    pub(crate) fn clear(&self, entry: &Arc<ProviderEntry>) -> usize {
        let dropped: Vec<_> = entry.with_state(|state| state.retry_queue.drain(..).collect());
        let count = dropped.len();
        drop(dropped);

        if count > 0 {
            info!("Cleared {} queued operations for provider {}", count, entry.key());
        }
        count
    }

    /// Stop the provider's worker, if one is running
    pub(crate) fn stop_worker(&self, entry: &Arc<ProviderEntry>) {
        if let Some(worker) = entry.with_state(|state| state.worker.take()) {
            worker.abort();
        }
    }
}
