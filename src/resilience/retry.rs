use crate::errors::{FabricError, FabricResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Fraction of the computed backoff used as the jitter band (+/- 20%).
const JITTER_RATIO: f64 = 0.2;

/// Predicate deciding whether a failed attempt is worth retrying.
pub type RetryClassifier = Arc<dyn Fn(&FabricError) -> bool + Send + Sync>;

/// Backoff policy for retrying a protected operation.
///
/// Immutable once an operation is registered; supplied by the caller or
/// defaulted from [`FabricConfig`](crate::config::FabricConfig).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of invocations allowed (first call included)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any computed delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_multiplier: f64,
    /// Whether to spread delays by +/- 20% to avoid retry storms
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, for call sites where failover to a
    /// different dependency is the recovery mechanism.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Retry executor that runs an operation under a [`RetryPolicy`].
///
/// Sleeps between attempts are cooperative (`tokio::time::sleep`), so a
/// backing-off operation never blocks unrelated work. The executor itself
/// neither logs nor persists; observability goes through [`RetryHook`].
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: Option<RetryClassifier>,
    attempt_timeout: Option<Duration>,
    retry_hook: Option<Arc<dyn RetryHook>>,
}

impl RetryExecutor {
    /// Create a new retry executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: None,
            attempt_timeout: None,
            retry_hook: None,
        }
    }

    /// Replace the default retryability classification
    /// ([`FabricError::is_retryable`]) with a caller-supplied predicate.
    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Race every attempt against a timer. An attempt exceeding the limit
    /// fails with [`FabricError::Timeout`], which aborts the retry loop.
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    /// Add a hook observing (and optionally overriding) retry decisions
    pub fn with_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.retry_hook = Some(hook);
        self
    }

    /// Execute the given operation with retry logic.
    ///
    /// Non-retryable errors propagate immediately. When every attempt has
    /// been used the last error is returned wrapped in
    /// [`FabricError::RetryExhausted`].
    pub async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> FabricResult<T>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = FabricResult<T>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let outcome = match self.attempt_timeout {
                Some(limit) => match timeout(limit, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(FabricError::Timeout {
                        operation: operation.to_string(),
                        elapsed: limit,
                    }),
                },
                None => f().await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if !self.is_retryable(&error) => return Err(error),
                Err(error) => {
                    last_error = Some(error.clone());

                    if attempt == max_attempts {
                        break;
                    }

                    let delay = self.calculate_backoff(attempt, error.retry_after());

                    if let Some(hook) = &self.retry_hook {
                        match hook
                            .on_retry(RetryContext {
                                attempt,
                                error: error.clone(),
                                delay,
                                operation: operation.to_string(),
                            })
                            .await
                        {
                            RetryDecision::Abort => return Err(error),
                            RetryDecision::Retry(custom_delay) => {
                                sleep(custom_delay).await;
                                continue;
                            }
                            RetryDecision::Default => {}
                        }
                    }

                    sleep(delay).await;
                }
            }
        }

        let source = last_error.unwrap_or_else(|| FabricError::Internal {
            message: format!("retry loop for `{}` ended without an error", operation),
        });
        Err(FabricError::RetryExhausted {
            operation: operation.to_string(),
            attempts: max_attempts,
            source: Box::new(source),
        })
    }

    fn is_retryable(&self, error: &FabricError) -> bool {
        match &self.classifier {
            Some(classifier) => classifier(error),
            None => error.is_retryable(),
        }
    }

    /// Calculate the backoff delay after the given (1-based) failed attempt
    fn calculate_backoff(&self, attempt: u32, server_retry_after: Option<Duration>) -> Duration {
        let base_delay = self.policy.initial_delay.as_millis() as f64
            * self.policy.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_ms = if self.policy.jitter {
            let jitter_range = base_delay * JITTER_RATIO;
            let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
            base_delay + jitter
        } else {
            base_delay
        };

        let capped = delay_ms
            .min(self.policy.max_delay.as_millis() as f64)
            .max(0.0);
        let calculated = Duration::from_millis(capped as u64);

        // A rate-limited dependency knows better than our schedule.
        match server_retry_after {
            Some(server_delay) if server_delay > calculated => server_delay,
            _ => calculated,
        }
    }
}

/// Hook for observing and overriding retry behavior
#[async_trait]
pub trait RetryHook: Send + Sync {
    /// Called before each scheduled retry; the returned decision may
    /// replace the computed delay or abort the loop.
    async fn on_retry(&self, context: RetryContext) -> RetryDecision;
}

/// Context information for a retry attempt
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// The (1-based) attempt that just failed
    pub attempt: u32,
    /// The error it failed with
    pub error: FabricError,
    /// The delay computed for the upcoming retry
    pub delay: Duration,
    /// Operation key of the protected call
    pub operation: String,
}

/// Decision on how to proceed with a retry
#[derive(Debug)]
pub enum RetryDecision {
    /// Use the default retry behavior
    Default,
    /// Retry with a custom delay
    Retry(Duration),
    /// Abort the retry and return the error
    Abort,
}
