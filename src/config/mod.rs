//! Configuration types for the resilience fabric.

use crate::errors::{FabricError, FabricResult};
use crate::resilience::{BulkheadConfig, CircuitBreakerConfig, RetryPolicy};
use std::str::FromStr;
use std::time::Duration;

/// Default protections applied to operations that do not supply their own
/// policy sections.
#[derive(Debug, Clone, Default)]
pub struct FabricConfig {
    /// Default retry policy
    pub retry: RetryPolicy,
    /// Default circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Default bulkhead configuration
    pub bulkhead: BulkheadConfig,
}

impl FabricConfig {
    /// Creates a new configuration builder
    pub fn builder() -> FabricConfigBuilder {
        FabricConfigBuilder::default()
    }

    /// Creates a configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to the built-in defaults:
    ///
    /// - `FABRIC_MAX_ATTEMPTS`, `FABRIC_INITIAL_DELAY_MS`,
    ///   `FABRIC_MAX_DELAY_MS`, `FABRIC_BACKOFF_MULTIPLIER`
    /// - `FABRIC_FAILURE_THRESHOLD`, `FABRIC_RESET_TIMEOUT_SECS`
    /// - `FABRIC_MAX_CONCURRENT`, `FABRIC_MAX_QUEUE_SIZE`,
    ///   `FABRIC_QUEUE_TIMEOUT_SECS`
    pub fn from_env() -> FabricResult<Self> {
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_attempts: env_parse("FABRIC_MAX_ATTEMPTS")
                .unwrap_or(defaults.retry.max_attempts),
            initial_delay: env_parse("FABRIC_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_delay),
            max_delay: env_parse("FABRIC_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
            backoff_multiplier: env_parse("FABRIC_BACKOFF_MULTIPLIER")
                .unwrap_or(defaults.retry.backoff_multiplier),
            jitter: defaults.retry.jitter,
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env_parse("FABRIC_FAILURE_THRESHOLD")
                .unwrap_or(defaults.circuit_breaker.failure_threshold),
            reset_timeout: env_parse("FABRIC_RESET_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.circuit_breaker.reset_timeout),
        };

        let bulkhead = BulkheadConfig {
            max_concurrent: env_parse("FABRIC_MAX_CONCURRENT")
                .unwrap_or(defaults.bulkhead.max_concurrent),
            max_queue_size: env_parse("FABRIC_MAX_QUEUE_SIZE")
                .unwrap_or(defaults.bulkhead.max_queue_size),
            queue_timeout: env_parse("FABRIC_QUEUE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .map(Some)
                .unwrap_or(defaults.bulkhead.queue_timeout),
        };

        FabricConfigBuilder::default()
            .retry(retry)
            .circuit_breaker(circuit_breaker)
            .bulkhead(bulkhead)
            .build()
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

/// Builder for [`FabricConfig`]
#[derive(Default)]
pub struct FabricConfigBuilder {
    retry: Option<RetryPolicy>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    bulkhead: Option<BulkheadConfig>,
}

impl FabricConfigBuilder {
    /// Sets the default retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the default circuit breaker configuration
    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Sets the default bulkhead configuration
    pub fn bulkhead(mut self, bulkhead: BulkheadConfig) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// Validates and builds the configuration
    pub fn build(self) -> FabricResult<FabricConfig> {
        let config = FabricConfig {
            retry: self.retry.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
            bulkhead: self.bulkhead.unwrap_or_default(),
        };

        if config.retry.max_attempts == 0 {
            return Err(FabricError::Configuration {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if config.retry.backoff_multiplier < 1.0 {
            return Err(FabricError::Configuration {
                message: "retry.backoff_multiplier must be at least 1.0".to_string(),
            });
        }
        if config.circuit_breaker.failure_threshold == 0 {
            return Err(FabricError::Configuration {
                message: "circuit_breaker.failure_threshold must be at least 1".to_string(),
            });
        }
        if config.bulkhead.max_concurrent == 0 {
            return Err(FabricError::Configuration {
                message: "bulkhead.max_concurrent must be at least 1".to_string(),
            });
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FabricConfig::builder().build().expect("valid defaults");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.bulkhead.max_concurrent, 10);
    }

    #[test]
    fn test_builder_overrides() {
        let config = FabricConfig::builder()
            .retry(RetryPolicy {
                max_attempts: 5,
                ..Default::default()
            })
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(5),
            })
            .build()
            .expect("valid config");

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let result = FabricConfig::builder()
            .retry(RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(FabricError::Configuration { .. })));
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let result = FabricConfig::builder()
            .retry(RetryPolicy {
                backoff_multiplier: 0.5,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(FabricError::Configuration { .. })));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let result = FabricConfig::builder()
            .bulkhead(BulkheadConfig {
                max_concurrent: 0,
                max_queue_size: 5,
                queue_timeout: None,
            })
            .build();
        assert!(matches!(result, Err(FabricError::Configuration { .. })));
    }
}
