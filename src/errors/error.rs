//! Error types for the resilience fabric.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for fabric operations
pub type FabricResult<T> = Result<T, FabricError>;

/// Reason a bulkhead turned a caller away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// Both the active slots and the wait queue were full
    QueueFull,
    /// The caller waited in the queue until the queue timeout fired
    QueueTimeout,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::QueueFull => write!(f, "queue full"),
            RejectionReason::QueueTimeout => write!(f, "queue timeout"),
        }
    }
}

/// A single provider's failure within a routing attempt chain.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    /// Name of the provider that failed
    pub provider: String,
    /// The error it failed with
    pub error: Box<FabricError>,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

/// Main error type for the resilience fabric.
///
/// Every rejection a caller can observe is a distinct variant so that
/// backpressure (`BulkheadRejected`), fast-fail (`CircuitOpen`), admission
/// denial (`RateLimited`) and retry exhaustion (`RetryExhausted`) can be
/// told apart and handled differently.
#[derive(Error, Debug, Clone)]
pub enum FabricError {
    /// Configuration error (invalid settings, missing required fields)
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// An attempt exceeded its per-attempt timeout
    #[error("Operation `{operation}` timed out after {elapsed:?}")]
    Timeout {
        /// Operation key of the protected call
        operation: String,
        /// How long the attempt was allowed to run
        elapsed: Duration,
    },

    /// All retry attempts were used; the last observed error is attached
    #[error("Operation `{operation}` exhausted {attempts} attempts: {source}")]
    RetryExhausted {
        /// Operation key of the protected call
        operation: String,
        /// Number of attempts performed
        attempts: u32,
        /// The last error observed before giving up
        #[source]
        source: Box<FabricError>,
    },

    /// Fast-fail: the dependency behind this operation is presumed unhealthy
    #[error("Circuit breaker for `{operation}` is open")]
    CircuitOpen {
        /// Operation key of the protected call
        operation: String,
        /// Time until the breaker will admit a probe, if known
        retry_after: Option<Duration>,
    },

    /// Explicit backpressure: concurrency capacity for this operation is exhausted
    #[error("Bulkhead for `{operation}` rejected the call ({reason})")]
    BulkheadRejected {
        /// Operation key of the protected call
        operation: String,
        /// Whether the queue was full or the queue wait timed out
        reason: RejectionReason,
    },

    /// Admission denied by the rate limiter
    #[error("Rate limit exceeded for `{key}`")]
    RateLimited {
        /// Bucket key (`identity:rule`) that was over limit
        key: String,
        /// Duration to wait before the bucket admits again, if known
        retry_after: Option<Duration>,
    },

    /// No registered provider can satisfy the task's required capabilities
    #[error("No provider available for category `{category}`")]
    NoProviderAvailable {
        /// Task category that could not be routed
        category: String,
    },

    /// Every eligible provider was attempted and failed
    #[error("All providers failed for category `{category}` ({} attempted)", .failures.len())]
    AllProvidersFailed {
        /// Task category that could not be served
        category: String,
        /// Per-provider errors, in attempt order
        failures: Vec<ProviderFailure>,
    },

    /// The caller cancelled the task before it completed
    #[error("Operation `{operation}` was cancelled by the caller")]
    Cancelled {
        /// Operation key of the protected call
        operation: String,
    },

    /// Pass-through error from the wrapped call
    #[error("{message}")]
    Operation {
        /// Error message from the wrapped call
        message: String,
        /// Whether the failure looks transient (drives the default retry classifier)
        transient: bool,
    },

    /// Internal error (unexpected conditions, library bugs)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal issue
        message: String,
    },
}

/// Error signatures treated as transient by [`FabricError::operation`].
const TRANSIENT_SIGNATURES: [&str; 6] = [
    "timeout",
    "timed out",
    "connection reset",
    "rate limit",
    "temporarily unavailable",
    "too many requests",
];

fn matches_transient_signature(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lowered.contains(sig))
}

impl FabricError {
    /// Wraps a dependency error, classifying it by its message.
    ///
    /// Messages matching the usual transient signatures (timeout,
    /// connection reset, rate limit, temporarily unavailable) are marked
    /// retryable; anything else is terminal.
    pub fn operation(message: impl Into<String>) -> Self {
        let message = message.into();
        let transient = matches_transient_signature(&message);
        FabricError::Operation { message, transient }
    }

    /// Wraps a dependency error that is known to be worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        FabricError::Operation {
            message: message.into(),
            transient: true,
        }
    }

    /// Wraps a dependency error that must not be retried.
    pub fn terminal(message: impl Into<String>) -> Self {
        FabricError::Operation {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if this error is retryable with exponential backoff.
    ///
    /// Retryable errors are rate-limit pushback and transient wrapped-call
    /// failures. Fabric-enforced attempt timeouts are terminal for the
    /// retry loop, as are all rejection kinds.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FabricError::RateLimited { .. } | FabricError::Operation { transient: true, .. }
        )
    }

    /// Returns true if this error should count against the dependency's
    /// circuit breaker.
    ///
    /// Broader than [`is_retryable`](Self::is_retryable): an attempt
    /// timeout is not retried, but a hanging dependency is exactly what a
    /// breaker protects against. Caller cancellation and terminal caller
    /// errors never count.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            FabricError::RateLimited { .. }
                | FabricError::Timeout { .. }
                | FabricError::Operation { transient: true, .. }
        )
    }

    /// Returns the retry-after duration if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FabricError::RateLimited { retry_after, .. }
            | FabricError::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_signature_classification() {
        assert!(FabricError::operation("connection reset by peer").is_retryable());
        assert!(FabricError::operation("Request timed out").is_retryable());
        assert!(FabricError::operation("503 temporarily unavailable").is_retryable());
        assert!(!FabricError::operation("invalid request body").is_retryable());
    }

    #[test]
    fn test_error_is_retryable() {
        let rate_limited = FabricError::RateLimited {
            key: "user-1:chat".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(rate_limited.is_retryable());

        let timeout = FabricError::Timeout {
            operation: "ai.chat_completion".to_string(),
            elapsed: Duration::from_secs(5),
        };
        assert!(!timeout.is_retryable());
        assert!(timeout.is_dependency_failure());

        let open = FabricError::CircuitOpen {
            operation: "db.query".to_string(),
            retry_after: None,
        };
        assert!(!open.is_retryable());
        assert!(!open.is_dependency_failure());
    }

    #[test]
    fn test_retry_after() {
        let rate_limited = FabricError::RateLimited {
            key: "k".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(30)));

        let terminal = FabricError::terminal("bad request");
        assert_eq!(terminal.retry_after(), None);
    }

    #[test]
    fn test_all_providers_failed_display() {
        let err = FabricError::AllProvidersFailed {
            category: "chat".to_string(),
            failures: vec![
                ProviderFailure {
                    provider: "alpha".to_string(),
                    error: Box::new(FabricError::transient("connection reset")),
                },
                ProviderFailure {
                    provider: "beta".to_string(),
                    error: Box::new(FabricError::Timeout {
                        operation: "orchestrator.beta".to_string(),
                        elapsed: Duration::from_secs(1),
                    }),
                },
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("chat"));
        assert!(rendered.contains("2 attempted"));
    }
}
