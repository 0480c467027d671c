use crate::errors::FabricResult;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;

/// An interchangeable backend for a task category.
///
/// Implemented by collaborators (AI completion backends, alternate data
/// stores); the router owns eligibility, ranking and failover across the
/// registered set. `Req` and `Res` are the category's request and response
/// types; the fabric never inspects them.
#[async_trait]
pub trait Provider<Req, Res>: Send + Sync
where
    Req: Send,
    Res: Send,
{
    /// Unique provider name; also keys the provider's dedicated circuit
    /// breaker (`orchestrator.<name>`)
    fn name(&self) -> &str;

    /// Task types this provider declares it can handle
    fn capabilities(&self) -> &HashSet<String>;

    /// Cheap liveness hint consulted during candidate filtering
    fn is_available(&self) -> bool {
        true
    }

    /// Perform the work
    async fn invoke(&self, request: Req) -> FabricResult<Res>;
}

/// A unit of routable work. Transient: built per call, never persisted.
#[derive(Debug, Clone)]
pub struct TaskDescriptor<Req> {
    /// Task category, used in routing errors and logs
    pub category: String,
    /// The request handed to the chosen provider
    pub payload: Req,
    /// Capabilities a provider must declare to be eligible
    pub required_capabilities: HashSet<String>,
}

impl<Req> TaskDescriptor<Req> {
    /// Create a task with no capability requirements
    pub fn new(category: impl Into<String>, payload: Req) -> Self {
        Self {
            category: category.into(),
            payload,
            required_capabilities: HashSet::new(),
        }
    }

    /// Require a capability of any provider handling this task
    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }
}

/// Result of routing a task.
#[derive(Debug, Clone)]
pub struct RouteOutcome<Res> {
    /// The response produced
    pub value: Res,
    /// Which provider served it; `None` when the router-level fallback did
    pub provider: Option<String>,
    /// True when the value came from a fallback rather than a provider
    pub degraded: bool,
}

/// Exported per-provider counters for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderMetricsSnapshot {
    /// Provider name
    pub name: String,
    /// Whether the provider currently reports itself available
    pub available: bool,
    /// Recency-weighted average invocation latency
    pub ema_latency_ms: f64,
    /// Success ratio over the recent bounded window
    pub success_rate: f64,
    /// Invocations issued since registration
    pub total_calls: u64,
    /// Invocations that failed after per-provider retries
    pub total_failures: u64,
}
