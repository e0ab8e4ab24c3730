//! Per-provider rate-limit state and the store that partitions it

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::circuit_breaker::CircuitState;
use crate::queue::RetryQueueItem;

/// Quota assumed for a provider until its first real observation
pub const DEFAULT_QUOTA: u64 = 5000;

/// Opaque identifier of one external provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderKey(Arc<str>);

impl ProviderKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&ProviderKey> for ProviderKey {
    fn from(value: &ProviderKey) -> Self {
        value.clone()
    }
}

impl AsRef<str> for ProviderKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifetime counters for one provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetrics {
    /// Operation invocations, direct and queued
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Failures classified as rate limits
    pub total_rate_limited: u64,
    /// Calls refused because the circuit was open
    pub total_rejected: u64,
    /// Backoff sleeps taken by the executor
    pub total_retries: u64,
    pub total_enqueued: u64,
    /// Queued items that exhausted their attempts
    pub total_abandoned: u64,
}

/// Mutable state of one provider.
///
/// Only reachable through [`ProviderEntry::with_state`], which holds the
/// entry's lock for the duration of one synchronous transition.
pub struct ProviderRateLimitState {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: Option<DateTime<Utc>>,
    pub(crate) circuit: CircuitState,
    pub(crate) opened_at: Option<Instant>,
    pub(crate) half_open_in_flight: u32,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub(crate) retry_queue: VecDeque<RetryQueueItem>,
    /// Items taken out of the queue by a running sweep
    pub(crate) in_flight: usize,
    pub(crate) worker: Option<JoinHandle<()>>,
    pub metrics: ProviderMetrics,
}

impl ProviderRateLimitState {
    pub(crate) fn new() -> Self {
        Self {
            remaining: DEFAULT_QUOTA,
            limit: DEFAULT_QUOTA,
            reset_at: None,
            circuit: CircuitState::Closed,
            opened_at: None,
            half_open_in_flight: 0,
            failure_count: 0,
            last_failure_at: None,
            retry_queue: VecDeque::new(),
            in_flight: 0,
            worker: None,
            metrics: ProviderMetrics::default(),
        }
    }

    /// Last committed circuit phase, without applying the open timer
    pub fn circuit_phase(&self) -> CircuitState {
        self.circuit
    }

    /// Queued plus in-flight items, the figure the capacity bound applies to
    pub fn queue_occupancy(&self) -> usize {
        self.retry_queue.len() + self.in_flight
    }

    /// Whether a quota snapshot shows more than half the limit available
    pub fn quota_is_healthy(&self) -> bool {
        self.limit > 0 && self.remaining.saturating_mul(2) > self.limit
    }

    /// Overwrite whichever quota fields an observation carries
    pub(crate) fn record_quota(
        &mut self,
        remaining: Option<u64>,
        limit: Option<u64>,
        reset_at: Option<DateTime<Utc>>,
    ) {
        if let Some(remaining) = remaining {
            self.remaining = remaining;
        }
        if let Some(limit) = limit {
            self.limit = limit;
        }
        if reset_at.is_some() {
            self.reset_at = reset_at;
        }
    }

    pub(crate) fn worker_active(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

/// Point-in-time view of a provider for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider: ProviderKey,
    pub circuit: CircuitState,
    pub failure_count: u32,
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub queue_len: usize,
    pub in_flight: usize,
    pub worker_active: bool,
    pub metrics: ProviderMetrics,
}

/// One provider's key and its lock-guarded state
pub struct ProviderEntry {
    key: ProviderKey,
    state: Mutex<ProviderRateLimitState>,
}

impl ProviderEntry {
    fn new(key: ProviderKey) -> Self {
        Self {
            key,
            state: Mutex::new(ProviderRateLimitState::new()),
        }
    }

    pub fn key(&self) -> &ProviderKey {
        &self.key
    }

    /// Run one state transition under the entry lock.
    ///
    /// The closure must not block; no lock is ever held across an `.await`.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ProviderRateLimitState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }
}

/// Map of provider to state, created on first reference to each key
#[derive(Default)]
pub struct ProviderStateStore {
    entries: RwLock<HashMap<ProviderKey, Arc<ProviderEntry>>>,
}

impl ProviderStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a provider, creating its state on a miss
    pub fn entry(&self, key: &ProviderKey) -> Arc<ProviderEntry> {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }

        let mut entries = self.entries.write();
        entries
            .entry(key.clone())
            .or_insert_with(|| {
                log::debug!("Tracking rate-limit state for provider {}", key);
                Arc::new(ProviderEntry::new(key.clone()))
            })
            .clone()
    }

    /// Look up a provider without creating it
    pub fn get(&self, key: &ProviderKey) -> Option<Arc<ProviderEntry>> {
        self.entries.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ProviderKey> {
        let mut keys: Vec<_> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn entries(&self) -> Vec<Arc<ProviderEntry>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_created_once_per_key() {
        let store = ProviderStateStore::new();
        let linear = ProviderKey::from("linear");

        let first = store.entry(&linear);
        let second = store.entry(&linear);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);

        store.entry(&ProviderKey::from("notion"));
        assert_eq!(store.keys(), vec![linear, ProviderKey::from("notion")]);
    }

    #[test]
    fn test_get_does_not_create() {
        let store = ProviderStateStore::new();
        assert!(store.get(&ProviderKey::from("slack")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_new_state_defaults() {
        let store = ProviderStateStore::new();
        let entry = store.entry(&ProviderKey::from("github"));

        entry.with_state(|state| {
            assert_eq!(state.circuit_phase(), CircuitState::Closed);
            assert_eq!(state.failure_count, 0);
            assert_eq!(state.remaining, DEFAULT_QUOTA);
            assert_eq!(state.limit, DEFAULT_QUOTA);
            assert_eq!(state.queue_occupancy(), 0);
            assert!(state.quota_is_healthy());
            assert!(!state.worker_active());
        });
    }

    #[test]
    fn test_quota_health_threshold() {
        let store = ProviderStateStore::new();
        let entry = store.entry(&ProviderKey::from("jira"));

        entry.with_state(|state| {
            state.limit = 100;
            state.remaining = 50;
            assert!(!state.quota_is_healthy());
            state.remaining = 51;
            assert!(state.quota_is_healthy());
            state.limit = 0;
            assert!(!state.quota_is_healthy());
        });
    }

    #[test]
    fn test_provider_key_serializes_as_string() {
        let key = ProviderKey::from(String::from("notion"));
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"notion\"");
        assert_eq!(key.to_string(), "notion");
    }
}
