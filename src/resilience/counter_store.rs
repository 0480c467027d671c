use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Error raised by a counter store backend.
///
/// Deliberately opaque: the rate limiter treats any store error as "the
/// shared backend is unreachable" and falls back to local counting.
#[derive(Debug, Clone, Error)]
#[error("counter store unavailable: {0}")]
pub struct StoreError(pub String);

/// Point-in-time view of one bucket's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Points accumulated in the current window
    pub points: u64,
    /// Epoch milliseconds at which the current window ends
    pub window_reset_ms: u64,
    /// Epoch milliseconds until which the bucket is blocked, if any
    pub blocked_until_ms: Option<u64>,
}

/// Shared counter backend for rate limiting.
///
/// Implementations against an external store (for cross-process counting)
/// are injected by the application; [`InMemoryCounterStore`] is the
/// single-process implementation and the fallback when the external store
/// is unreachable.
///
/// `increment` must behave as one atomic round-trip: expire the window,
/// add `cost`, and return the resulting snapshot. If the bucket is
/// currently blocked the cost must NOT be added; the snapshot is returned
/// as-is so the caller can compute `retry_after`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `cost` to the bucket's window and return its state
    async fn increment(
        &self,
        key: &str,
        cost: u64,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError>;

    /// Mark the bucket inadmissible until the given epoch-millisecond instant
    async fn block(&self, key: &str, until_ms: u64) -> Result<(), StoreError>;

    /// Drop all state for the bucket
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct BucketEntry {
    points: u64,
    window_reset_ms: u64,
    blocked_until_ms: Option<u64>,
}

/// In-process [`CounterStore`] backed by a keyed map.
///
/// Accurate within one process only; expired buckets are evicted either by
/// an explicitly spawned sweeper task or by calling
/// [`sweep_expired`](Self::sweep_expired) directly.
#[derive(Default)]
pub struct InMemoryCounterStore {
    buckets: Mutex<HashMap<String, BucketEntry>>,
}

impl InMemoryCounterStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buckets (test and health introspection)
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Evict buckets whose window has ended and whose block (if any) has
    /// expired. Returns the number of evicted buckets.
    pub fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, entry| {
            entry.window_reset_ms > now || entry.blocked_until_ms.is_some_and(|until| until > now)
        });
        before - buckets.len()
    }

    /// Spawn a background task sweeping expired buckets at the given
    /// interval, bounding the store's memory. The task runs until aborted
    /// or until the store is dropped by every other holder.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        let evicted = store.sweep_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, "rate limit bucket sweep");
                        }
                    }
                    None => return,
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        cost: u64,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        let now = now_millis();
        let mut buckets = self.buckets.lock();
        let entry = buckets.entry(key.to_string()).or_insert(BucketEntry {
            points: 0,
            window_reset_ms: now + window.as_millis() as u64,
            blocked_until_ms: None,
        });

        if let Some(until) = entry.blocked_until_ms {
            if until > now {
                return Ok(CounterSnapshot {
                    points: entry.points,
                    window_reset_ms: entry.window_reset_ms,
                    blocked_until_ms: Some(until),
                });
            }
            entry.blocked_until_ms = None;
        }

        if now >= entry.window_reset_ms {
            entry.points = 0;
            entry.window_reset_ms = now + window.as_millis() as u64;
        }
        entry.points += cost;

        Ok(CounterSnapshot {
            points: entry.points,
            window_reset_ms: entry.window_reset_ms,
            blocked_until_ms: None,
        })
    }

    async fn block(&self, key: &str, until_ms: u64) -> Result<(), StoreError> {
        let mut buckets = self.buckets.lock();
        if let Some(entry) = buckets.get_mut(key) {
            entry.blocked_until_ms = Some(until_ms);
        } else {
            buckets.insert(
                key.to_string(),
                BucketEntry {
                    points: 0,
                    window_reset_ms: until_ms,
                    blocked_until_ms: Some(until_ms),
                },
            );
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.buckets.lock().remove(key);
        Ok(())
    }
}

/// Current time as epoch milliseconds
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
