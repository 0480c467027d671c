use crate::config::FabricConfig;
use crate::errors::{FabricError, FabricResult};
use crate::observability::{metric_names, MetricsCollector, NoopMetricsCollector};
use crate::resilience::bulkhead::{Bulkhead, BulkheadConfig};
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHook, CircuitState,
};
use crate::resilience::counter_store::CounterStore;
use crate::resilience::rate_limiter::{RateLimitRule, RateLimiter};
use crate::resilience::retry::{RetryClassifier, RetryExecutor, RetryHook, RetryPolicy};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Smoothing factor for the per-operation latency average.
const LATENCY_EMA_ALPHA: f64 = 0.2;
/// Recent latency samples retained per operation for percentiles.
const LATENCY_WINDOW: usize = 256;

/// Rate-limit admission section of an [`ExecutionPolicy`].
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Logical identity being limited (user id, IP, route)
    pub identity: String,
    /// The rule to enforce
    pub rule: RateLimitRule,
    /// Points this call consumes
    pub cost: u64,
}

impl RateLimitPolicy {
    /// Limit `identity` under `rule` at a cost of one point per call
    pub fn new(identity: impl Into<String>, rule: RateLimitRule) -> Self {
        Self {
            identity: identity.into(),
            rule,
            cost: 1,
        }
    }

    /// Override the per-call point cost
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

/// Last-resort answer for a protected call.
///
/// Producing a fallback is the only place the fabric converts an error
/// into a success, and the conversion is always visible through
/// [`ExecutionOutcome::degraded`].
pub struct Fallback<T>(Arc<dyn Fn() -> T + Send + Sync>);

impl<T> Fallback<T> {
    /// Serve clones of a fixed value
    pub fn value(value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self(Arc::new(move || value.clone()))
    }

    /// Serve the result of a function
    pub fn compute(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn produce(&self) -> T {
        (self.0)()
    }
}

impl<T> Clone for Fallback<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> std::fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Fallback(..)")
    }
}

/// Per-call policy for [`ResilienceManager::execute`].
///
/// The retry, breaker and bulkhead sections only take effect the first
/// time an operation key is seen; they configure the operation's
/// process-lifetime state. The rate limit, timeout, fallback, classifier
/// and hook apply to the individual call.
pub struct ExecutionPolicy<T> {
    /// Retry policy for the operation (first use wins)
    pub retry: Option<RetryPolicy>,
    /// Circuit breaker configuration for the operation (first use wins)
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Bulkhead configuration for the operation (first use wins)
    pub bulkhead: Option<BulkheadConfig>,
    /// Admission control for this call
    pub rate_limit: Option<RateLimitPolicy>,
    /// Per-attempt timeout for this call
    pub timeout: Option<Duration>,
    /// Value or function served when the call is rejected or exhausted
    pub fallback: Option<Fallback<T>>,
    /// Replaces the default retryability classification for this call
    pub retry_classifier: Option<RetryClassifier>,
    /// Observer for retry decisions on this call
    pub retry_hook: Option<Arc<dyn RetryHook>>,
}

impl<T> Default for ExecutionPolicy<T> {
    fn default() -> Self {
        Self {
            retry: None,
            circuit_breaker: None,
            bulkhead: None,
            rate_limit: None,
            timeout: None,
            fallback: None,
            retry_classifier: None,
            retry_hook: None,
        }
    }
}

impl<T> ExecutionPolicy<T> {
    /// Set the operation's retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the operation's circuit breaker configuration
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Set the operation's bulkhead configuration
    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    /// Rate-limit this call
    pub fn with_rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Set a per-attempt timeout for this call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Serve this fallback when the call is rejected or exhausted
    pub fn with_fallback(mut self, fallback: Fallback<T>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Result of a protected call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome<T> {
    /// The value produced by the call or its fallback
    pub value: T,
    /// True when the value came from a fallback rather than the real call
    pub degraded: bool,
}

impl<T> ExecutionOutcome<T> {
    /// Unwrap the value, discarding the degradation flag
    pub fn into_value(self) -> T {
        self.value
    }
}

struct LatencyTrack {
    ema_ms: f64,
    seeded: bool,
    samples: VecDeque<f64>,
}

impl LatencyTrack {
    fn record(&mut self, millis: f64) {
        if self.seeded {
            self.ema_ms = LATENCY_EMA_ALPHA * millis + (1.0 - LATENCY_EMA_ALPHA) * self.ema_ms;
        } else {
            self.ema_ms = millis;
            self.seeded = true;
        }
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(millis);
    }

    fn percentile(&self, quantile: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let index = ((sorted.len() - 1) as f64 * quantile).round() as usize;
        Some(sorted[index])
    }
}

struct OperationStats {
    calls: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    latency: Mutex<LatencyTrack>,
}

impl OperationStats {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            latency: Mutex::new(LatencyTrack {
                ema_ms: 0.0,
                seeded: false,
                samples: VecDeque::with_capacity(LATENCY_WINDOW),
            }),
        }
    }
}

struct OperationState {
    breaker: CircuitBreaker,
    bulkhead: Bulkhead,
    retry: RetryPolicy,
    stats: OperationStats,
}

/// Health view of one circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerHealth {
    /// Operation key
    pub operation: String,
    /// Current state name
    pub state: String,
    /// Consecutive dependency failures while closed
    pub consecutive_failures: u32,
    /// Milliseconds until an open breaker admits a probe
    pub retry_in_ms: Option<u64>,
}

/// Health view of one bulkhead.
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadHealth {
    /// Operation key
    pub operation: String,
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

/// Health view of the rate limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitHealth {
    /// Buckets currently held by the in-process tier
    pub local_buckets: usize,
    /// Checks served by the in-process tier because the shared store errored
    pub store_fallbacks: u64,
}

/// Aggregated operational health, for dashboards and tooling.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// One entry per known operation
    pub circuit_breakers: Vec<CircuitBreakerHealth>,
    /// One entry per known operation
    pub bulkheads: Vec<BulkheadHealth>,
    /// Rate limiter state
    pub rate_limits: RateLimitHealth,
    /// Human-readable conditions that warrant attention
    pub issues: Vec<String>,
}

/// Counters and latency summary for one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    /// Operation key
    pub operation: String,
    /// Protected calls attempted
    pub calls: u64,
    /// Calls that executed and failed
    pub failures: u64,
    /// Calls turned away before execution
    pub rejections: u64,
    /// Fraction of attempted calls that succeeded
    pub success_rate: f64,
    /// Recency-weighted average latency
    pub avg_latency_ms: f64,
    /// Median latency over the recent window
    pub p50_latency_ms: Option<f64>,
    /// 95th percentile latency over the recent window
    pub p95_latency_ms: Option<f64>,
    /// Current breaker state name
    pub circuit_state: String,
}

/// Machine-readable export of per-operation counters.
#[derive(Debug, Clone, Serialize)]
pub struct FabricSnapshot {
    /// When the snapshot was taken
    pub generated_at: DateTime<Utc>,
    /// One entry per known operation
    pub operations: Vec<OperationSnapshot>,
}

struct TracingBreakerHook {
    operation: String,
}

impl CircuitBreakerHook for TracingBreakerHook {
    fn on_state_change(&self, old_state: CircuitState, new_state: CircuitState) {
        match new_state {
            CircuitState::Open => tracing::warn!(
                operation = %self.operation,
                from = old_state.as_str(),
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen => tracing::debug!(
                operation = %self.operation,
                "circuit breaker half-open, probing"
            ),
            CircuitState::Closed => tracing::info!(
                operation = %self.operation,
                "circuit breaker closed"
            ),
        }
    }
}

/// Entry point for protected calls.
///
/// Owns the per-operation registry (circuit breaker, bulkhead, retry
/// policy, created lazily on first use and kept for the process lifetime)
/// and the keyed rate limiter. Applications construct one manager at
/// startup and pass it by [`Arc`] to call sites; there is no implicit
/// global instance, so tests and tenants get isolated managers for free.
///
/// Composition order for [`execute`](Self::execute): rate-limit admission,
/// bulkhead slot, circuit breaker gate, retry loop around the raw call.
/// Any rejection short-circuits the stages after it.
pub struct ResilienceManager {
    defaults: FabricConfig,
    operations: RwLock<HashMap<String, Arc<OperationState>>>,
    rate_limiter: RateLimiter,
    metrics: Arc<dyn MetricsCollector>,
}

impl ResilienceManager {
    /// Create a manager with the given defaults and no shared counter store
    pub fn new(defaults: FabricConfig) -> Self {
        Self::builder().defaults(defaults).build()
    }

    /// Create a builder for configuring the manager
    pub fn builder() -> ResilienceManagerBuilder {
        ResilienceManagerBuilder::new()
    }

    /// Execute `f` under the operation's protections.
    ///
    /// Returns the call's value (or the configured fallback, flagged
    /// `degraded`) or one typed [`FabricError`]; errors from the wrapped
    /// call never escape unwrapped.
    pub async fn execute<F, Fut, T>(
        &self,
        operation: &str,
        f: F,
        policy: ExecutionPolicy<T>,
    ) -> FabricResult<ExecutionOutcome<T>>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = FabricResult<T>> + Send,
        T: Send,
    {
        let op = self.operation_state(operation, &policy);
        let labels = [("operation", operation)];
        let started = Instant::now();

        let result = self.run_protected(&op, operation, &f, &policy).await;

        op.stats.calls.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .increment_counter(metric_names::CALL_COUNT, 1, &labels);

        match &result {
            Ok(_) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                op.stats.latency.lock().record(elapsed_ms);
                self.metrics
                    .record_histogram(metric_names::CALL_DURATION_MS, elapsed_ms, &labels);
            }
            Err(error) if is_rejection(error) => {
                op.stats.rejections.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .increment_counter(metric_names::CALL_REJECTIONS, 1, &labels);
            }
            Err(_) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                op.stats.failures.fetch_add(1, Ordering::Relaxed);
                op.stats.latency.lock().record(elapsed_ms);
                self.metrics
                    .increment_counter(metric_names::CALL_ERRORS, 1, &labels);
                self.metrics
                    .record_histogram(metric_names::CALL_DURATION_MS, elapsed_ms, &labels);
            }
        }
        self.metrics.set_gauge(
            metric_names::CIRCUIT_BREAKER_STATE,
            state_code(op.breaker.state()),
            &labels,
        );

        match result {
            Ok(value) => Ok(ExecutionOutcome {
                value,
                degraded: false,
            }),
            Err(error) => match &policy.fallback {
                Some(fallback) => {
                    tracing::warn!(
                        operation = %operation,
                        error = %error,
                        "serving fallback for failed call"
                    );
                    self.metrics
                        .increment_counter(metric_names::FALLBACK_SERVED, 1, &labels);
                    Ok(ExecutionOutcome {
                        value: fallback.produce(),
                        degraded: true,
                    })
                }
                None => Err(error),
            },
        }
    }

    async fn run_protected<F, Fut, T>(
        &self,
        op: &Arc<OperationState>,
        operation: &str,
        f: &F,
        policy: &ExecutionPolicy<T>,
    ) -> FabricResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = FabricResult<T>> + Send,
        T: Send,
    {
        if let Some(rate_limit) = &policy.rate_limit {
            let decision = self
                .rate_limiter
                .check(&rate_limit.identity, &rate_limit.rule, rate_limit.cost)
                .await?;
            if !decision.allowed {
                return Err(FabricError::RateLimited {
                    key: format!("{}:{}", rate_limit.identity, rate_limit.rule.name),
                    retry_after: decision.retry_after,
                });
            }
        }

        // The slot is held for the whole retry loop: an operation that is
        // backing off still occupies its partition, not someone else's.
        let _slot = op.bulkhead.acquire().await?;

        let mut executor = RetryExecutor::new(op.retry.clone());
        if let Some(classifier) = &policy.retry_classifier {
            executor = executor.with_classifier(Arc::clone(classifier));
        }
        if let Some(hook) = &policy.retry_hook {
            executor = executor.with_hook(Arc::clone(hook));
        }

        let attempt_timeout = policy.timeout;
        let op_for_attempts = Arc::clone(op);
        let operation_name = operation.to_string();
        let guarded = move || {
            let op = Arc::clone(&op_for_attempts);
            let operation = operation_name.clone();
            let attempt = f();
            async move {
                let permit = op.breaker.try_acquire()?;
                let outcome = match attempt_timeout {
                    Some(limit) => match tokio::time::timeout(limit, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(FabricError::Timeout {
                            operation,
                            elapsed: limit,
                        }),
                    },
                    None => attempt.await,
                };
                match outcome {
                    Ok(value) => {
                        permit.success();
                        Ok(value)
                    }
                    Err(error) => {
                        if error.is_dependency_failure() {
                            permit.failure();
                        }
                        Err(error)
                    }
                }
            }
        };

        executor.execute(operation, guarded).await
    }

    fn operation_state<T>(&self, operation: &str, policy: &ExecutionPolicy<T>) -> Arc<OperationState> {
        if let Some(op) = self.operations.read().get(operation) {
            return Arc::clone(op);
        }
        let mut operations = self.operations.write();
        let entry = operations
            .entry(operation.to_string())
            .or_insert_with(|| {
                let breaker_config = policy
                    .circuit_breaker
                    .clone()
                    .unwrap_or_else(|| self.defaults.circuit_breaker.clone());
                let bulkhead_config = policy
                    .bulkhead
                    .clone()
                    .unwrap_or_else(|| self.defaults.bulkhead.clone());
                let retry = policy
                    .retry
                    .clone()
                    .unwrap_or_else(|| self.defaults.retry.clone());
                Arc::new(OperationState {
                    breaker: CircuitBreaker::new(operation, breaker_config).with_hook(Arc::new(
                        TracingBreakerHook {
                            operation: operation.to_string(),
                        },
                    )),
                    bulkhead: Bulkhead::new(operation, bulkhead_config),
                    retry,
                    stats: OperationStats::new(),
                })
            });
        Arc::clone(entry)
    }

    /// Reset the operation's circuit breaker. A no-op for unknown keys.
    pub fn reset(&self, operation: &str) {
        if let Some(op) = self.operations.read().get(operation) {
            op.breaker.reset();
        }
    }

    /// Manually trip the operation's circuit breaker. A no-op for unknown keys.
    pub fn force_open(&self, operation: &str) {
        if let Some(op) = self.operations.read().get(operation) {
            op.breaker.force_open();
        }
    }

    /// Manually close the operation's circuit breaker. A no-op for unknown keys.
    pub fn force_close(&self, operation: &str) {
        if let Some(op) = self.operations.read().get(operation) {
            op.breaker.force_close();
        }
    }

    /// Current breaker state for an operation, if it has been used
    pub fn circuit_state(&self, operation: &str) -> Option<CircuitState> {
        self.operations
            .read()
            .get(operation)
            .map(|op| op.breaker.state())
    }

    /// Whether the operation's breaker is currently refusing calls.
    ///
    /// Unknown operations report unblocked; an open breaker whose cooldown
    /// has lapsed flips to half-open and also reports unblocked.
    pub fn is_circuit_blocked(&self, operation: &str) -> bool {
        match self.operations.read().get(operation) {
            Some(op) => op.breaker.is_open(),
            None => false,
        }
    }

    /// The keyed rate limiter backing rate-limit policies
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Administrative override: clear a rate-limit bucket on both tiers
    pub async fn reset_rate_limit(&self, identity: &str, rule_name: &str) -> FabricResult<()> {
        self.rate_limiter.reset(identity, rule_name).await
    }

    /// Spawn the background sweep bounding the in-process rate-limit
    /// bucket map. One call at application startup is enough.
    pub fn spawn_rate_limit_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.rate_limiter.local_store().spawn_sweeper(interval)
    }

    /// Aggregated health of every known operation, for operational tooling
    pub fn health_status(&self) -> HealthStatus {
        let operations = self.operations.read();
        let mut circuit_breakers = Vec::with_capacity(operations.len());
        let mut bulkheads = Vec::with_capacity(operations.len());
        let mut issues = Vec::new();

        let mut keys: Vec<&String> = operations.keys().collect();
        keys.sort();

        for key in keys {
            let op = &operations[key];
            let breaker = op.breaker.snapshot();
            if breaker.state == CircuitState::Open {
                issues.push(format!("circuit breaker for `{}` is open", key));
            }
            circuit_breakers.push(CircuitBreakerHealth {
                operation: key.clone(),
                state: breaker.state.as_str().to_string(),
                consecutive_failures: breaker.consecutive_failures,
                retry_in_ms: breaker.retry_in.map(|d| d.as_millis() as u64),
            });

            let bulkhead = op.bulkhead.snapshot();
            if bulkhead.queued >= bulkhead.max_queue_size && bulkhead.max_queue_size > 0 {
                issues.push(format!("bulkhead queue for `{}` is full", key));
            }
            bulkheads.push(BulkheadHealth {
                operation: key.clone(),
                active: bulkhead.active,
                queued: bulkhead.queued,
                max_concurrent: bulkhead.max_concurrent,
                max_queue_size: bulkhead.max_queue_size,
                rejected: bulkhead.rejected,
            });
        }

        let store_fallbacks = self.rate_limiter.fallback_count();
        if store_fallbacks > 0 {
            issues.push(format!(
                "rate limiter served {} checks from the in-process fallback",
                store_fallbacks
            ));
        }

        HealthStatus {
            circuit_breakers,
            bulkheads,
            rate_limits: RateLimitHealth {
                local_buckets: self.rate_limiter.local_store().bucket_count(),
                store_fallbacks,
            },
            issues,
        }
    }

    /// Machine-readable counters for every known operation
    pub fn metrics_snapshot(&self) -> FabricSnapshot {
        let operations = self.operations.read();
        let mut keys: Vec<&String> = operations.keys().collect();
        keys.sort();

        let snapshots = keys
            .into_iter()
            .map(|key| {
                let op = &operations[key];
                let calls = op.stats.calls.load(Ordering::Relaxed);
                let failures = op.stats.failures.load(Ordering::Relaxed);
                let rejections = op.stats.rejections.load(Ordering::Relaxed);
                let latency = op.stats.latency.lock();
                OperationSnapshot {
                    operation: key.clone(),
                    calls,
                    failures,
                    rejections,
                    success_rate: if calls > 0 {
                        (calls - failures - rejections) as f64 / calls as f64
                    } else {
                        1.0
                    },
                    avg_latency_ms: latency.ema_ms,
                    p50_latency_ms: latency.percentile(0.5),
                    p95_latency_ms: latency.percentile(0.95),
                    circuit_state: op.breaker.state().as_str().to_string(),
                }
            })
            .collect();

        FabricSnapshot {
            generated_at: Utc::now(),
            operations: snapshots,
        }
    }
}

fn is_rejection(error: &FabricError) -> bool {
    matches!(
        error,
        FabricError::CircuitOpen { .. }
            | FabricError::BulkheadRejected { .. }
            | FabricError::RateLimited { .. }
    )
}

fn state_code(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    }
}

/// Builder for configuring a [`ResilienceManager`]
pub struct ResilienceManagerBuilder {
    defaults: FabricConfig,
    counter_store: Option<Arc<dyn CounterStore>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl ResilienceManagerBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            defaults: FabricConfig::default(),
            counter_store: None,
            metrics: None,
        }
    }

    /// Set the default retry/breaker/bulkhead configuration
    pub fn defaults(mut self, defaults: FabricConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Inject a shared counter store for cross-process rate limiting
    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    /// Emit counters and histograms to the given collector
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the manager
    pub fn build(self) -> ResilienceManager {
        let mut rate_limiter = RateLimiter::new();
        if let Some(store) = self.counter_store {
            rate_limiter = rate_limiter.with_remote_store(store);
        }
        ResilienceManager {
            defaults: self.defaults,
            operations: RwLock::new(HashMap::new()),
            rate_limiter,
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(NoopMetricsCollector)),
        }
    }
}

impl Default for ResilienceManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn manager() -> ResilienceManager {
        ResilienceManager::new(FabricConfig::default())
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_execute_success_is_not_degraded() {
        let manager = manager();
        let outcome = manager
            .execute("db.query", || async { Ok(42) }, ExecutionPolicy::default())
            .await
            .expect("execute");
        assert_eq!(outcome.value, 42);
        assert!(!outcome.degraded);
    }

    #[tokio::test]
    async fn test_execute_retries_until_success() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let outcome = manager
            .execute(
                "flaky.op",
                move || {
                    let calls = calls_clone.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(FabricError::transient("connection reset"))
                        } else {
                            Ok("ok")
                        }
                    }
                },
                ExecutionPolicy::default().with_retry(fast_retry(4)),
            )
            .await
            .expect("execute");

        assert_eq!(outcome.value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_blocks_without_invoking() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = || {
            ExecutionPolicy::<u32>::default()
                .with_retry(fast_retry(1))
                .with_circuit_breaker(CircuitBreakerConfig {
                    failure_threshold: 2,
                    reset_timeout: Duration::from_secs(60),
                })
        };

        for _ in 0..2 {
            let calls = calls.clone();
            let result = manager
                .execute(
                    "ai.chat_completion",
                    move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err(FabricError::transient("temporarily unavailable"))
                        }
                    },
                    policy(),
                )
                .await;
            assert!(result.is_err());
        }
        assert_eq!(
            manager.circuit_state("ai.chat_completion"),
            Some(CircuitState::Open)
        );

        let calls_clone = calls.clone();
        let result = manager
            .execute(
                "ai.chat_completion",
                move || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    }
                },
                policy(),
            )
            .await;

        assert!(matches!(result, Err(FabricError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "open breaker must not invoke");
    }

    #[tokio::test]
    async fn test_fallback_marks_outcome_degraded() {
        let manager = manager();
        let outcome = manager
            .execute(
                "down.op",
                || async { Err(FabricError::transient("timeout")) },
                ExecutionPolicy::default()
                    .with_retry(fast_retry(2))
                    .with_fallback(Fallback::value("cached")),
            )
            .await
            .expect("fallback served");

        assert_eq!(outcome.value, "cached");
        assert!(outcome.degraded);
    }

    #[tokio::test]
    async fn test_rate_limit_denial_short_circuits() {
        let manager = manager();
        let rule = RateLimitRule::new("tight", 1, Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));

        for attempt in 0..2 {
            let calls_clone = calls.clone();
            let result = manager
                .execute(
                    "limited.op",
                    move || {
                        let calls = calls_clone.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    },
                    ExecutionPolicy::default()
                        .with_rate_limit(RateLimitPolicy::new("user-1", rule.clone())),
                )
                .await;
            if attempt == 0 {
                assert!(result.is_ok());
            } else {
                assert!(matches!(result, Err(FabricError::RateLimited { .. })));
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_style_errors_do_not_trip_breaker() {
        let manager = manager();
        let policy = || {
            ExecutionPolicy::<u32>::default()
                .with_retry(fast_retry(1))
                .with_circuit_breaker(CircuitBreakerConfig {
                    failure_threshold: 1,
                    reset_timeout: Duration::from_secs(60),
                })
        };

        let result = manager
            .execute(
                "cancelled.op",
                || async {
                    Err(FabricError::Cancelled {
                        operation: "cancelled.op".to_string(),
                    })
                },
                policy(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(
            manager.circuit_state("cancelled.op"),
            Some(CircuitState::Closed)
        );
    }

    #[tokio::test]
    async fn test_operation_keys_are_isolated() {
        let manager = manager();
        let policy = || {
            ExecutionPolicy::<u32>::default()
                .with_retry(fast_retry(1))
                .with_circuit_breaker(CircuitBreakerConfig {
                    failure_threshold: 1,
                    reset_timeout: Duration::from_secs(60),
                })
        };

        let result = manager
            .execute(
                "dep.a",
                || async { Err(FabricError::transient("timeout")) },
                policy(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(manager.circuit_state("dep.a"), Some(CircuitState::Open));

        // A different key is untouched by dep.a's meltdown.
        let outcome = manager
            .execute("dep.b", || async { Ok(7) }, policy())
            .await
            .expect("execute");
        assert_eq!(outcome.value, 7);
    }

    #[tokio::test]
    async fn test_admin_overrides_are_idempotent_on_unknown_keys() {
        let manager = manager();
        manager.reset("never.seen");
        manager.force_open("never.seen");
        manager.force_close("never.seen");
        assert_eq!(manager.circuit_state("never.seen"), None);
        assert!(!manager.is_circuit_blocked("never.seen"));
    }

    #[tokio::test]
    async fn test_force_open_blocks_known_operation() {
        let manager = manager();
        let _ = manager
            .execute("ops.op", || async { Ok(()) }, ExecutionPolicy::default())
            .await;

        manager.force_open("ops.op");
        assert!(manager.is_circuit_blocked("ops.op"));

        let result = manager
            .execute("ops.op", || async { Ok(()) }, ExecutionPolicy::default())
            .await;
        assert!(matches!(result, Err(FabricError::CircuitOpen { .. })));

        manager.force_close("ops.op");
        assert!(manager
            .execute("ops.op", || async { Ok(()) }, ExecutionPolicy::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_per_attempt_timeout_counts_toward_breaker() {
        let manager = manager();
        let result = manager
            .execute(
                "slow.op",
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                ExecutionPolicy::default()
                    .with_retry(fast_retry(1))
                    .with_timeout(Duration::from_millis(20))
                    .with_circuit_breaker(CircuitBreakerConfig {
                        failure_threshold: 1,
                        reset_timeout: Duration::from_secs(60),
                    }),
            )
            .await;

        assert!(matches!(result, Err(FabricError::Timeout { .. })));
        assert_eq!(manager.circuit_state("slow.op"), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_health_status_reports_issues() {
        let manager = manager();
        let policy = || {
            ExecutionPolicy::<u32>::default()
                .with_retry(fast_retry(1))
                .with_circuit_breaker(CircuitBreakerConfig {
                    failure_threshold: 1,
                    reset_timeout: Duration::from_secs(60),
                })
        };
        let _ = manager
            .execute(
                "bad.op",
                || async { Err(FabricError::transient("timeout")) },
                policy(),
            )
            .await;

        let health = manager.health_status();
        assert_eq!(health.circuit_breakers.len(), 1);
        assert_eq!(health.circuit_breakers[0].state, "open");
        assert_eq!(health.bulkheads.len(), 1);
        assert!(health
            .issues
            .iter()
            .any(|issue| issue.contains("bad.op")));

        let rendered = serde_json::to_string(&health).expect("serialize");
        assert!(rendered.contains("\"circuit_breakers\""));
    }

    #[tokio::test]
    async fn test_metrics_snapshot_counts_calls() {
        let manager = manager();
        for _ in 0..3 {
            let _ = manager
                .execute("m.op", || async { Ok(1) }, ExecutionPolicy::default())
                .await;
        }
        let _ = manager
            .execute(
                "m.op",
                || async { Err(FabricError::terminal("bad input")) },
                ExecutionPolicy::<i32>::default(),
            )
            .await;

        let snapshot = manager.metrics_snapshot();
        assert_eq!(snapshot.operations.len(), 1);
        let op = &snapshot.operations[0];
        assert_eq!(op.operation, "m.op");
        assert_eq!(op.calls, 4);
        assert_eq!(op.failures, 1);
        assert_eq!(op.rejections, 0);
        assert!((op.success_rate - 0.75).abs() < f64::EPSILON);
        assert!(op.p50_latency_ms.is_some());

        let rendered = serde_json::to_string(&snapshot).expect("serialize");
        assert!(rendered.contains("\"success_rate\""));
    }

    #[tokio::test]
    async fn test_collector_receives_counters() {
        use crate::observability::InMemoryMetricsCollector;

        let collector = Arc::new(InMemoryMetricsCollector::new());
        let manager = ResilienceManager::builder()
            .metrics(collector.clone())
            .build();

        let _ = manager
            .execute("c.op", || async { Ok(()) }, ExecutionPolicy::default())
            .await;

        assert_eq!(
            collector.get_counter("fabric.calls.total:operation=c.op"),
            1
        );
    }
}
