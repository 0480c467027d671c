use crate::errors::{FabricError, FabricResult, ProviderFailure};
use crate::observability::{metric_names, MetricsCollector, NoopMetricsCollector};
use crate::orchestrator::provider::{
    Provider, ProviderMetricsSnapshot, RouteOutcome, TaskDescriptor,
};
use crate::resilience::{
    CircuitBreakerConfig, ExecutionPolicy, Fallback, ResilienceManager, RetryPolicy,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Routing behavior knobs.
///
/// Per-provider retries are deliberately shallow: switching to an
/// alternate provider is the primary failure-recovery mechanism, so the
/// budget for hammering a single struggling backend stays small.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Ceiling on provider invocations per task, across all candidates
    pub max_total_attempts: usize,
    /// Retry policy for each provider invocation
    pub provider_retry: RetryPolicy,
    /// Configuration for each provider's dedicated circuit breaker
    pub provider_breaker: CircuitBreakerConfig,
    /// Per-attempt timeout for provider invocations
    pub provider_timeout: Option<Duration>,
    /// Smoothing factor for per-provider latency averages
    pub ema_alpha: f64,
    /// Recent invocations considered for the success rate
    pub success_window: usize,
    /// Ranking weight for capability-match specificity (primary)
    pub specificity_weight: f64,
    /// Ranking weight for recent success rate (secondary)
    pub success_weight: f64,
    /// Ranking weight for inverse average latency (tertiary)
    pub latency_weight: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_total_attempts: 3,
            provider_retry: RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
                backoff_multiplier: 2.0,
                jitter: true,
            },
            provider_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(30),
            },
            provider_timeout: None,
            ema_alpha: 0.2,
            success_window: 50,
            specificity_weight: 0.5,
            success_weight: 0.3,
            latency_weight: 0.2,
        }
    }
}

struct ProviderStats {
    ema_ms: f64,
    seeded: bool,
    recent: VecDeque<bool>,
    total_calls: u64,
    total_failures: u64,
}

impl ProviderStats {
    fn new() -> Self {
        Self {
            ema_ms: 0.0,
            seeded: false,
            recent: VecDeque::new(),
            total_calls: 0,
            total_failures: 0,
        }
    }

    fn record(&mut self, latency_ms: f64, success: bool, alpha: f64, window: usize) {
        self.total_calls += 1;
        if !success {
            self.total_failures += 1;
        }
        if self.seeded {
            self.ema_ms = alpha * latency_ms + (1.0 - alpha) * self.ema_ms;
        } else {
            self.ema_ms = latency_ms;
            self.seeded = true;
        }
        if self.recent.len() == window.max(1) {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    /// Optimistic for unproven providers, so newcomers get traffic.
    fn success_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        let successes = self.recent.iter().filter(|s| **s).count();
        successes as f64 / self.recent.len() as f64
    }
}

struct ProviderEntry<Req, Res> {
    provider: Arc<dyn Provider<Req, Res>>,
    stats: Mutex<ProviderStats>,
}

/// Capability-aware router over a set of interchangeable providers.
///
/// Holds the provider registry and per-provider rolling metrics, and
/// routes each task to the best currently-healthy candidate: eligibility
/// is capability superset plus availability plus a non-open dedicated
/// circuit breaker; ranking weighs specificity, recent success rate and
/// inverse average latency. Invocations run through the
/// [`ResilienceManager`], so per-provider breakers and shallow retries
/// apply; on failure the router moves to the next candidate, bounded by a
/// total-attempts ceiling, and surfaces the full per-provider error chain
/// when everything fails.
pub struct ProviderRouter<Req, Res> {
    manager: Arc<ResilienceManager>,
    config: RouterConfig,
    providers: RwLock<HashMap<String, Arc<ProviderEntry<Req, Res>>>>,
    fallback: Option<Fallback<Res>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl<Req, Res> ProviderRouter<Req, Res>
where
    Req: Clone + Send + Sync + 'static,
    Res: Send + 'static,
{
    /// Create a router with default configuration
    pub fn new(manager: Arc<ResilienceManager>) -> Self {
        Self::with_config(manager, RouterConfig::default())
    }

    /// Create a router with explicit configuration
    pub fn with_config(manager: Arc<ResilienceManager>, config: RouterConfig) -> Self {
        Self {
            manager,
            config,
            providers: RwLock::new(HashMap::new()),
            fallback: None,
            metrics: Arc::new(NoopMetricsCollector),
        }
    }

    /// Serve this fallback when no provider can complete a task
    pub fn with_fallback(mut self, fallback: Fallback<Res>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Emit routing counters to the given collector
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register a provider. Re-registering a name replaces the previous
    /// provider and resets its rolling metrics.
    pub fn register(&self, provider: Arc<dyn Provider<Req, Res>>) {
        let name = provider.name().to_string();
        tracing::info!(provider = %name, "provider registered");
        self.providers.write().insert(
            name,
            Arc::new(ProviderEntry {
                provider,
                stats: Mutex::new(ProviderStats::new()),
            }),
        );
    }

    /// Remove a provider. Returns false if the name was unknown.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.providers.write().remove(name).is_some();
        if removed {
            tracing::info!(provider = %name, "provider deregistered");
        }
        removed
    }

    /// Names of all registered providers, sorted
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Per-provider rolling metrics, sorted by name
    pub fn provider_metrics(&self) -> Vec<ProviderMetricsSnapshot> {
        let providers = self.providers.read();
        let mut snapshots: Vec<ProviderMetricsSnapshot> = providers
            .iter()
            .map(|(name, entry)| {
                let stats = entry.stats.lock();
                ProviderMetricsSnapshot {
                    name: name.clone(),
                    available: entry.provider.is_available(),
                    ema_latency_ms: stats.ema_ms,
                    success_rate: stats.success_rate(),
                    total_calls: stats.total_calls,
                    total_failures: stats.total_failures,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Route a task to the best currently-healthy provider.
    ///
    /// Returns the winning provider's response, a degraded fallback
    /// response, or [`FabricError::NoProviderAvailable`] /
    /// [`FabricError::AllProvidersFailed`] with the attempt chain.
    pub async fn route_task(&self, task: TaskDescriptor<Req>) -> FabricResult<RouteOutcome<Res>> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut failures: Vec<ProviderFailure> = Vec::new();
        let mut attempts = 0;

        while attempts < self.config.max_total_attempts {
            let Some((name, entry)) = self.best_candidate(&task, &excluded) else {
                break;
            };
            attempts += 1;

            let operation = breaker_key(&name);
            let provider = Arc::clone(&entry.provider);
            let payload = task.payload.clone();
            let started = Instant::now();

            let mut policy = ExecutionPolicy::default()
                .with_retry(self.config.provider_retry.clone())
                .with_circuit_breaker(self.config.provider_breaker.clone());
            if let Some(limit) = self.config.provider_timeout {
                policy = policy.with_timeout(limit);
            }

            let result = self
                .manager
                .execute(
                    &operation,
                    move || {
                        let provider = Arc::clone(&provider);
                        let payload = payload.clone();
                        async move { provider.invoke(payload).await }
                    },
                    policy,
                )
                .await;

            let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
            let labels = [("provider", name.as_str())];
            self.metrics
                .increment_counter(metric_names::PROVIDER_CALLS, 1, &labels);

            match result {
                Ok(outcome) => {
                    entry.stats.lock().record(
                        elapsed_ms,
                        true,
                        self.config.ema_alpha,
                        self.config.success_window,
                    );
                    return Ok(RouteOutcome {
                        value: outcome.value,
                        provider: Some(name),
                        degraded: outcome.degraded,
                    });
                }
                Err(error) => {
                    entry.stats.lock().record(
                        elapsed_ms,
                        false,
                        self.config.ema_alpha,
                        self.config.success_window,
                    );
                    self.metrics
                        .increment_counter(metric_names::PROVIDER_ERRORS, 1, &labels);
                    tracing::warn!(
                        provider = %name,
                        category = %task.category,
                        error = %error,
                        "provider failed, trying alternates"
                    );
                    failures.push(ProviderFailure {
                        provider: name.clone(),
                        error: Box::new(error),
                    });
                    excluded.insert(name);
                }
            }
        }

        if let Some(fallback) = &self.fallback {
            tracing::warn!(
                category = %task.category,
                attempted = failures.len(),
                "serving router fallback"
            );
            return Ok(RouteOutcome {
                value: fallback.produce(),
                provider: None,
                degraded: true,
            });
        }

        if failures.is_empty() {
            Err(FabricError::NoProviderAvailable {
                category: task.category,
            })
        } else {
            self.metrics
                .increment_counter(metric_names::ROUTE_EXHAUSTED, 1, &[]);
            Err(FabricError::AllProvidersFailed {
                category: task.category,
                failures,
            })
        }
    }

    fn best_candidate(
        &self,
        task: &TaskDescriptor<Req>,
        excluded: &HashSet<String>,
    ) -> Option<(String, Arc<ProviderEntry<Req, Res>>)> {
        let providers = self.providers.read();
        let mut best: Option<(f64, String, Arc<ProviderEntry<Req, Res>>)> = None;

        for (name, entry) in providers.iter() {
            if excluded.contains(name) || !entry.provider.is_available() {
                continue;
            }
            let capabilities = entry.provider.capabilities();
            if !task
                .required_capabilities
                .iter()
                .all(|capability| capabilities.contains(capability))
            {
                continue;
            }
            if self.manager.is_circuit_blocked(&breaker_key(name)) {
                continue;
            }

            let score = self.score(entry, task);
            let better = match &best {
                Some((best_score, best_name, _)) => {
                    score > *best_score || (score == *best_score && name < best_name)
                }
                None => true,
            };
            if better {
                best = Some((score, name.clone(), Arc::clone(entry)));
            }
        }

        best.map(|(_, name, entry)| (name, entry))
    }

    /// Weighted score, monotone in success rate and decreasing in average
    /// latency: at equal specificity a strictly healthier provider always
    /// outranks a strictly worse one.
    fn score(&self, entry: &ProviderEntry<Req, Res>, task: &TaskDescriptor<Req>) -> f64 {
        let capabilities = entry.provider.capabilities();
        let specificity = if capabilities.is_empty() {
            0.0
        } else {
            task.required_capabilities.len() as f64 / capabilities.len() as f64
        };
        let stats = entry.stats.lock();
        let latency_factor = 1.0 / (1.0 + stats.ema_ms);
        self.config.specificity_weight * specificity
            + self.config.success_weight * stats.success_rate()
            + self.config.latency_weight * latency_factor
    }
}

fn breaker_key(provider: &str) -> String {
    format!("orchestrator.{}", provider)
}
