//! Observability module providing metrics and logging capabilities.
//!
//! This module provides the observability surface of the fabric:
//!
//! - **Metrics**: counters, histograms and gauges behind the
//!   [`MetricsCollector`] trait, emitted by the manager and the router
//! - **Logging**: structured logging configuration with multiple formats
//!
//! ## Examples
//!
//! ```rust,no_run
//! use resilience_fabric::observability::{
//!     InMemoryMetricsCollector, MetricsCollector, LoggingConfig, LogLevel, LogFormat,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Initialize logging
//! LoggingConfig::new()
//!     .with_level(LogLevel::Info)
//!     .with_format(LogFormat::Json)
//!     .init()?;
//!
//! // Create metrics collector
//! let metrics = InMemoryMetricsCollector::new();
//! metrics.increment_counter("fabric.calls.total", 1, &[("operation", "db.query")]);
//! # Ok(())
//! # }
//! ```

mod logging;
mod metrics;

pub use logging::*;
pub use metrics::*;
