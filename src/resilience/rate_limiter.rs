use crate::errors::FabricResult;
use crate::resilience::counter_store::{
    now_millis, CounterSnapshot, CounterStore, InMemoryCounterStore,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A named admission rule: how many points a window holds, and the
/// optional penalty applied once a caller exceeds it.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    /// Rule name; part of the bucket key
    pub name: String,
    /// Points admitted per window
    pub limit: u64,
    /// Window length
    pub window: Duration,
    /// Penalty applied on exceeding the limit. A blocked bucket stays
    /// inadmissible until the penalty lapses, regardless of window resets.
    pub block_duration: Option<Duration>,
}

impl RateLimitRule {
    /// Create a rule admitting `limit` points per `window`
    pub fn new(name: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
            block_duration: None,
        }
    }

    /// Add a block penalty for callers that exceed the limit
    pub fn with_block_duration(mut self, duration: Duration) -> Self {
        self.block_duration = Some(duration);
        self
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the call is admitted
    pub allowed: bool,
    /// Points left in the current window (0 when denied)
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// How long to wait before the bucket admits again (denials only)
    pub retry_after: Option<Duration>,
}

/// Points-based admission control keyed by `(identity, rule)`.
///
/// Two-tier backend: when a shared [`CounterStore`] is injected it is
/// consulted first so that counting is consistent across processes; any
/// store error falls back transparently to in-process counting, trading
/// cross-instance accuracy for availability. The selection is explicit
/// (constructor injection), never probed from the environment.
pub struct RateLimiter {
    remote: Option<Arc<dyn CounterStore>>,
    local: Arc<InMemoryCounterStore>,
    fallbacks: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a limiter counting in-process only
    pub fn new() -> Self {
        Self {
            remote: None,
            local: Arc::new(InMemoryCounterStore::new()),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Count against a shared store first, keeping the in-process store
    /// as the fallback tier
    pub fn with_remote_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.remote = Some(store);
        self
    }

    /// The in-process fallback store (sweeper spawning, introspection)
    pub fn local_store(&self) -> &Arc<InMemoryCounterStore> {
        &self.local
    }

    /// How many checks were served by the fallback tier because the
    /// shared store errored
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Check admission for `cost` points against the rule's bucket for
    /// `identity`.
    ///
    /// An active block denies immediately without accruing points; an
    /// over-limit increment denies and, when the rule carries a
    /// `block_duration`, arms the block so that waiting out the window
    /// does not re-admit the caller.
    pub async fn check(
        &self,
        identity: &str,
        rule: &RateLimitRule,
        cost: u64,
    ) -> FabricResult<RateLimitDecision> {
        let key = bucket_key(identity, &rule.name);
        let (snapshot, fell_back) = self.increment(&key, cost, rule.window).await?;
        let now = now_millis();

        // A block dominates window state: points may have decayed to a
        // fresh window underneath it, the caller stays out regardless.
        if let Some(until) = snapshot.blocked_until_ms {
            if until > now {
                return Ok(RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at: timestamp(snapshot.window_reset_ms),
                    retry_after: Some(Duration::from_millis(until - now)),
                });
            }
        }

        if snapshot.points > rule.limit {
            let retry_after = match rule.block_duration {
                Some(penalty) => {
                    let until = now + penalty.as_millis() as u64;
                    self.arm_block(&key, until, fell_back).await;
                    Some(penalty)
                }
                None => Some(Duration::from_millis(
                    snapshot.window_reset_ms.saturating_sub(now),
                )),
            };
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: timestamp(snapshot.window_reset_ms),
                retry_after,
            });
        }

        Ok(RateLimitDecision {
            allowed: true,
            remaining: rule.limit - snapshot.points,
            reset_at: timestamp(snapshot.window_reset_ms),
            retry_after: None,
        })
    }

    /// Administrative override: drop all bucket state for
    /// `(identity, rule)` on both tiers.
    pub async fn reset(&self, identity: &str, rule_name: &str) -> FabricResult<()> {
        let key = bucket_key(identity, rule_name);
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.clear(&key).await {
                tracing::warn!(key = %key, error = %err, "counter store clear failed");
            }
        }
        self.local
            .clear(&key)
            .await
            .map_err(|err| crate::errors::FabricError::Internal {
                message: err.to_string(),
            })
    }

    async fn increment(
        &self,
        key: &str,
        cost: u64,
        window: Duration,
    ) -> FabricResult<(CounterSnapshot, bool)> {
        if let Some(remote) = &self.remote {
            match remote.increment(key, cost, window).await {
                Ok(snapshot) => return Ok((snapshot, false)),
                Err(err) => {
                    self.fallbacks.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        key = %key,
                        error = %err,
                        "counter store unreachable, serving from in-process fallback"
                    );
                }
            }
        }
        let snapshot = self
            .local
            .increment(key, cost, window)
            .await
            .map_err(|err| crate::errors::FabricError::Internal {
                message: err.to_string(),
            })?;
        Ok((snapshot, self.remote.is_some()))
    }

    async fn arm_block(&self, key: &str, until_ms: u64, fell_back: bool) {
        if !fell_back {
            if let Some(remote) = &self.remote {
                match remote.block(key, until_ms).await {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "counter store block failed, arming locally");
                    }
                }
            }
        }
        if let Err(err) = self.local.block(key, until_ms).await {
            tracing::warn!(key = %key, error = %err, "in-process block failed");
        }
    }
}

fn bucket_key(identity: &str, rule_name: &str) -> String {
    format!("{}:{}", identity, rule_name)
}

fn timestamp(epoch_ms: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms as i64).unwrap_or_else(Utc::now)
}
