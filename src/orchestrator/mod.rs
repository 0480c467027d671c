//! Capability-aware provider routing with live performance feedback.
//!
//! Providers implement [`Provider`] and register on a [`ProviderRouter`];
//! each incoming [`TaskDescriptor`] is routed to the best currently-healthy
//! candidate and failed over to alternates, with every invocation running
//! under the fabric's per-provider protections.

mod provider;
mod router;


pub use provider::{Provider, ProviderMetricsSnapshot, RouteOutcome, TaskDescriptor};
pub use router::{ProviderRouter, RouterConfig};
