//! Metrics sink collaborators.
//!
//! The core components emit counters and gauges through the [`MetricsSink`]
//! trait; the actual exporter (Prometheus or otherwise) lives outside this
//! crate. [`InMemoryMetrics`] backs tests and the `doctor` CLI output,
//! [`NoopMetrics`] is the default when no sink is wired in.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Executions started through the sandbox façade
pub const SANDBOX_EXEC_TOTAL: &str = "sandbox_exec_total";
/// Executions currently running or queued on the gate
pub const SANDBOX_EXEC_INFLIGHT: &str = "sandbox_exec_inflight";
/// Queries executed against managed databases
pub const DB_QUERY_TOTAL: &str = "db_query_total";
/// Cache lookups answered from either tier
pub const CACHE_HIT_TOTAL: &str = "cache_hit_total";
/// Cache lookups that missed both tiers
pub const CACHE_MISS_TOTAL: &str = "cache_miss_total";
/// Reconcile passes run by the always-on controller
pub const ALWAYS_ON_RECONCILES_TOTAL: &str = "always_on_reconciles_total";

/// Counter/gauge sink implemented by the metrics layer above this crate.
///
/// Implementations must be cheap and non-blocking; callers treat every
/// emission as fire-and-forget.
pub trait MetricsSink: Send + Sync {
    /// Increment a monotonic counter by `by`.
    fn incr_counter(&self, name: &str, by: u64);

    /// Set a gauge to an absolute value.
    fn set_gauge(&self, name: &str, value: i64);
}

/// Sink that drops every emission.
#[derive(Debug, Default, Clone)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str, _by: u64) {}
    fn set_gauge(&self, _name: &str, _value: i64) {}
}

/// In-process sink retaining the latest values, used by tests and the
/// `doctor` command.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, i64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 when never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// Current value of a gauge (0 when never set).
    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges.read().get(name).copied().unwrap_or(0)
    }

    /// Snapshot of every counter, for reporting.
    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters.read().clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr_counter(&self, name: &str, by: u64) {
        *self.counters.write().entry(name.to_string()).or_insert(0) += by;
    }

    fn set_gauge(&self, name: &str, value: i64) {
        self.gauges.write().insert(name.to_string(), value);
    }
}

/// Shared handle used by component constructors.
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Default sink when the caller wires none in.
pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetrics)
}
