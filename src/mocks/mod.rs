//! Mock implementations for testing.
//!
//! This module provides mock implementations of core traits to support
//! London-School TDD practices.

use crate::errors::{FabricError, FabricResult};
use crate::orchestrator::Provider;
use crate::resilience::{CounterSnapshot, CounterStore, InMemoryCounterStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

enum MockBehavior {
    Succeed,
    Fail(FabricError),
    Script(Mutex<VecDeque<FabricResult<String>>>),
}

/// Scripted provider over `String` request/response pairs.
///
/// Successful invocations answer `"<name>::<request>"` so tests can
/// assert which provider served a task.
pub struct MockProvider {
    name: String,
    capabilities: HashSet<String>,
    available: AtomicBool,
    invocations: AtomicU32,
    latency: Option<Duration>,
    behavior: MockBehavior,
}

impl MockProvider {
    /// A provider that always succeeds
    pub fn succeeding(name: impl Into<String>, capabilities: &[&str]) -> Self {
        Self::with_behavior(name, capabilities, MockBehavior::Succeed)
    }

    /// A provider that always fails with the given error
    pub fn failing(name: impl Into<String>, capabilities: &[&str], error: FabricError) -> Self {
        Self::with_behavior(name, capabilities, MockBehavior::Fail(error))
    }

    /// A provider that plays back the given results in order, then succeeds
    pub fn scripted(
        name: impl Into<String>,
        capabilities: &[&str],
        script: Vec<FabricResult<String>>,
    ) -> Self {
        Self::with_behavior(
            name,
            capabilities,
            MockBehavior::Script(Mutex::new(script.into())),
        )
    }

    fn with_behavior(
        name: impl Into<String>,
        capabilities: &[&str],
        behavior: MockBehavior,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            available: AtomicBool::new(true),
            invocations: AtomicU32::new(0),
            latency: None,
            behavior,
        }
    }

    /// Delay every invocation by the given duration
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Flip the availability hint
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// How many times `invoke` has run
    pub fn invocation_count(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider<String, String> for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &HashSet<String> {
        &self.capabilities
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn invoke(&self, request: String) -> FabricResult<String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match &self.behavior {
            MockBehavior::Succeed => Ok(format!("{}::{}", self.name, request)),
            MockBehavior::Fail(error) => Err(error.clone()),
            MockBehavior::Script(script) => script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("{}::{}", self.name, request))),
        }
    }
}

/// Counter store whose backend can be taken down mid-test, for exercising
/// the rate limiter's fallback tier.
pub struct FlakyCounterStore {
    inner: InMemoryCounterStore,
    failing: AtomicBool,
}

impl FlakyCounterStore {
    /// A healthy store; use [`set_failing`](Self::set_failing) to break it
    pub fn new() -> Self {
        Self {
            inner: InMemoryCounterStore::new(),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every call fail (or recover) from now on
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for FlakyCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for FlakyCounterStore {
    async fn increment(
        &self,
        key: &str,
        cost: u64,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        self.check()?;
        self.inner.increment(key, cost, window).await
    }

    async fn block(&self, key: &str, until_ms: u64) -> Result<(), StoreError> {
        self.check()?;
        self.inner.block(key, until_ms).await
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.clear(key).await
    }
}
