//! # Resilience & Multi-Provider Orchestration Fabric
//!
//! Production-ready protection and routing for calls to unreliable
//! external dependencies (AI completion services, databases, outbound
//! APIs).
//!
//! ## Features
//!
//! - Per-operation circuit breakers with single-probe half-open recovery
//! - Retry with exponential backoff, jitter and per-attempt timeouts
//! - Concurrency bulkheads with bounded FIFO wait queues
//! - Keyed rate limiting with a shared-store tier and in-process fallback
//! - One composed `execute` entry point per operation, with typed errors
//!   and visibly-degraded fallbacks
//! - Capability-aware provider routing with live performance feedback
//! - Built-in observability (structured logging, metrics, health export)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilience_fabric::{
//!     ExecutionPolicy, FabricConfig, FabricError, ResilienceManager,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // One manager per application, passed by Arc to call sites.
//!     let manager = Arc::new(ResilienceManager::new(FabricConfig::from_env()?));
//!
//!     let outcome = manager
//!         .execute(
//!             "ai.chat_completion",
//!             || async {
//!                 // ... call the dependency ...
//!                 Ok("response".to_string())
//!             },
//!             ExecutionPolicy::default(),
//!         )
//!         .await?;
//!
//!     println!("degraded: {} value: {}", outcome.degraded, outcome.value);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - `config` - Default protection configuration and builder
//! - `errors` - Typed error taxonomy (`CircuitOpen`, `BulkheadRejected`, ...)
//! - `resilience` - Retry, circuit breaker, bulkhead, rate limiter and the
//!   manager composing them
//! - `orchestrator` - Provider contract, registry and capability-aware
//!   routing
//! - `observability` - Logging configuration and metrics collection
//! - `mocks` - Mock implementations for testing
//! - `fixtures` - Test fixtures and helper data

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod config;
pub mod errors;
pub mod observability;
pub mod orchestrator;
pub mod resilience;

// Development/testing modules
#[cfg(test)]
pub mod fixtures;
#[cfg(test)]
pub mod mocks;

// Re-exports for convenience
pub use config::{FabricConfig, FabricConfigBuilder};
pub use errors::{FabricError, FabricResult, ProviderFailure, RejectionReason};
pub use observability::{
    InMemoryMetricsCollector, LogFormat, LogLevel, LoggingConfig, MetricsCollector,
    NoopMetricsCollector,
};
pub use orchestrator::{
    Provider, ProviderMetricsSnapshot, ProviderRouter, RouteOutcome, RouterConfig, TaskDescriptor,
};
pub use resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState, CounterStore,
    ExecutionOutcome, ExecutionPolicy, FabricSnapshot, Fallback, HealthStatus,
    InMemoryCounterStore, RateLimitPolicy, RateLimitRule, RateLimiter, ResilienceManager,
    ResilienceManagerBuilder, RetryExecutor, RetryPolicy,
};
