//! Metric and lifecycle event sinks
//!
//! The worker never talks to a metrics backend directly; everything goes
//! through the [`Monitor`] trait so that the core stays portable and tests
//! can capture emissions. The production implementation forwards counters,
//! measures, and lifecycle events to `tracing` with dedicated targets, which
//! the JSON log pipeline ships downstream.

use shared::LifecycleEvent;
use std::sync::Arc;
use tracing::{info, warn};

/// Sink for counters, measures, and lifecycle events.
pub trait Monitor: Send + Sync {
    /// Adds `n` to the named counter.
    fn count(&self, name: &str, n: u64);

    /// Records one sample of the named measure.
    fn measure(&self, name: &str, value: f64);

    /// Emits a lifecycle event record.
    fn log_event(&self, event: LifecycleEvent);

    /// Creates a monitor whose metric names are prefixed with `name`.
    fn child(&self, name: &str) -> Arc<dyn Monitor>;
}

/// Production monitor forwarding to `tracing`.
///
/// Counters and measures are emitted under the `metrics` target, lifecycle
/// events under the `events` target, so an env-filter can route them
/// independently of ordinary log lines.
pub struct TracingMonitor {
    prefix: String,
}

impl TracingMonitor {
    /// Creates an unprefixed root monitor.
    pub fn root() -> Arc<dyn Monitor> {
        Arc::new(Self {
            prefix: String::new(),
        })
    }

    fn scoped(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }
}

impl Monitor for TracingMonitor {
    fn count(&self, name: &str, n: u64) {
        info!(target: "metrics", metric = %self.scoped(name), value = n, "count");
    }

    fn measure(&self, name: &str, value: f64) {
        info!(target: "metrics", metric = %self.scoped(name), value, "measure");
    }

    fn log_event(&self, event: LifecycleEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "events", event = %json, "lifecycle event"),
            Err(e) => warn!("Failed to serialize lifecycle event: {}", e),
        }
    }

    fn child(&self, name: &str) -> Arc<dyn Monitor> {
        Arc::new(Self {
            prefix: self.scoped(name),
        })
    }
}
