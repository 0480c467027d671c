//! Test fixtures and helper data.
//!
//! This module provides common policy and rule shapes used across test
//! suites, tuned for fast test execution.

use crate::resilience::{BulkheadConfig, CircuitBreakerConfig, RetryPolicy};
use std::time::Duration;

/// Retry policy with millisecond delays and no jitter
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Breaker that trips quickly and cools down in milliseconds
pub fn tight_breaker(failure_threshold: u32, reset_ms: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        reset_timeout: Duration::from_millis(reset_ms),
    }
}

/// Bulkhead with no queue timeout
pub fn small_bulkhead(max_concurrent: usize, max_queue_size: usize) -> BulkheadConfig {
    BulkheadConfig {
        max_concurrent,
        max_queue_size,
        queue_timeout: None,
    }
}
