use crate::errors::{FabricError, FabricResult, RejectionReason};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Configuration for per-operation concurrency isolation
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum calls running concurrently
    pub max_concurrent: usize,
    /// Maximum callers waiting for a slot
    pub max_queue_size: usize,
    /// How long a queued caller waits before being rejected
    pub queue_timeout: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 20,
            queue_timeout: Some(Duration::from_secs(10)),
        }
    }
}

struct Waiter {
    id: u64,
    slot: oneshot::Sender<()>,
}

struct Inner {
    active: usize,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

/// Point-in-time view of a bulkhead, for health reporting.
#[derive(Debug, Clone)]
pub struct BulkheadSnapshot {
    /// Calls currently holding a slot
    pub active: usize,
    /// Callers currently queued
    pub queued: usize,
    /// Configured concurrency cap
    pub max_concurrent: usize,
    /// Configured queue bound
    pub max_queue_size: usize,
    /// Callers turned away since creation
    pub rejected: u64,
}

/// Per-operation concurrency limiter with a bounded FIFO wait queue.
///
/// A caller that cannot get a slot immediately waits in line; once both
/// the slots and the queue are full, further callers are rejected at once
/// with [`FabricError::BulkheadRejected`] so that one slow dependency
/// cannot absorb unbounded work. Slot release happens on every exit path
/// via the permit's `Drop`, and promotion is strictly FIFO. A queued
/// caller that is cancelled (its future dropped) leaves the queue without
/// disturbing the accounting; the hand-off logic skips dead waiters.
pub struct Bulkhead {
    operation: String,
    config: BulkheadConfig,
    inner: Mutex<Inner>,
    rejected: AtomicU64,
}

impl Bulkhead {
    /// Create a new bulkhead guarding the given operation key
    pub fn new(operation: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            operation: operation.into(),
            config,
            inner: Mutex::new(Inner {
                active: 0,
                queue: VecDeque::new(),
                next_id: 0,
            }),
            rejected: AtomicU64::new(0),
        }
    }

    /// Operation key this bulkhead guards
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Acquire a slot, waiting in FIFO order if the bulkhead is saturated.
    ///
    /// Fails fast with [`FabricError::BulkheadRejected`] when the wait
    /// queue is also full, or once the queue timeout fires.
    pub async fn acquire(&self) -> FabricResult<BulkheadPermit<'_>> {
        let (id, slot) = {
            let mut inner = self.inner.lock();
            if inner.active < self.config.max_concurrent {
                inner.active += 1;
                return Ok(BulkheadPermit { bulkhead: self });
            }
            if inner.queue.len() >= self.config.max_queue_size {
                drop(inner);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(self.rejection(RejectionReason::QueueFull));
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.queue.push_back(Waiter { id, slot: tx });
            (id, rx)
        };

        // From here on the queue entry must be reclaimed on every path:
        // the guard removes it if still queued, and hands a raced-in slot
        // onward if promotion won against cancellation or timeout.
        let mut guard = QueueEntryGuard {
            bulkhead: self,
            id,
            armed: true,
        };

        let waited = match self.config.queue_timeout {
            Some(limit) => timeout(limit, slot).await,
            None => Ok(slot.await),
        };

        match waited {
            Ok(Ok(())) => {
                guard.armed = false;
                Ok(BulkheadPermit { bulkhead: self })
            }
            Ok(Err(_)) => {
                // Unreachable while we hold the receiver: release_slot only
                // drops a sender whose receiver is already gone.
                guard.armed = false;
                Err(FabricError::Internal {
                    message: format!("bulkhead queue for `{}` dropped a waiter", self.operation),
                })
            }
            Err(_elapsed) => {
                drop(guard);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(self.rejection(RejectionReason::QueueTimeout))
            }
        }
    }

    /// Point-in-time snapshot for health reporting
    pub fn snapshot(&self) -> BulkheadSnapshot {
        let inner = self.inner.lock();
        BulkheadSnapshot {
            active: inner.active,
            queued: inner.queue.len(),
            max_concurrent: self.config.max_concurrent,
            max_queue_size: self.config.max_queue_size,
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Callers turned away since creation
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn rejection(&self, reason: RejectionReason) -> FabricError {
        FabricError::BulkheadRejected {
            operation: self.operation.clone(),
            reason,
        }
    }

    /// Hand the freed slot to the next live waiter, or retire it.
    fn release_slot(inner: &mut Inner) {
        while let Some(waiter) = inner.queue.pop_front() {
            // A closed receiver means that waiter timed out or was
            // cancelled after we popped its entry's predecessor; skip it.
            if waiter.slot.send(()).is_ok() {
                return;
            }
        }
        inner.active -= 1;
    }
}

/// RAII slot handle; releasing promotes the next queued caller in FIFO order.
pub struct BulkheadPermit<'a> {
    bulkhead: &'a Bulkhead,
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        let mut inner = self.bulkhead.inner.lock();
        Bulkhead::release_slot(&mut inner);
    }
}

struct QueueEntryGuard<'a> {
    bulkhead: &'a Bulkhead,
    id: u64,
    armed: bool,
}

impl Drop for QueueEntryGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.bulkhead.inner.lock();
        if let Some(position) = inner.queue.iter().position(|w| w.id == self.id) {
            let _ = inner.queue.remove(position);
        } else {
            // Promotion raced ahead of cancellation/timeout: we own a slot
            // nobody will use, so pass it on.
            Bulkhead::release_slot(&mut inner);
        }
    }
}
