//! Capacity accounting and utilization reporting
//!
//! The reporter keeps the last capacity snapshot and, whenever capacity
//! changes or the report timer fires, accrues time-weighted busy/idle
//! counters for the window since that snapshot. The weighting means the
//! counters integrate to "slot-milliseconds", which downstream dashboards
//! divide back into utilization.

use crate::monitor::Monitor;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Occupancy thresholds for the busy/idle histograms.
const THRESHOLDS: [u32; 7] = [0, 1, 2, 3, 4, 6, 8];

/// Immutable sample of slot occupancy at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct CapacitySnapshot {
    pub idle: u32,
    pub busy: u32,
    pub time: Instant,
}

/// Emits weighted capacity counters and the efficiency measure.
pub struct CapacityReporter {
    snapshot: CapacitySnapshot,
    monitor: Arc<dyn Monitor>,
}

impl CapacityReporter {
    pub fn new(monitor: Arc<dyn Monitor>, idle: u32, busy: u32) -> Self {
        Self {
            snapshot: CapacitySnapshot {
                idle,
                busy,
                time: Instant::now(),
            },
            monitor,
        }
    }

    /// The current snapshot.
    #[allow(dead_code)]
    pub fn snapshot(&self) -> CapacitySnapshot {
        self.snapshot
    }

    /// Accrues counters for the window covered by the previous snapshot,
    /// then replaces it with (now, idle, busy). Called on every capacity
    /// transition and on the report timer, so the counters always describe
    /// the state that actually held during the window.
    pub fn record(&mut self, idle: u32, busy: u32) {
        let now = Instant::now();
        let dt_ms = now.duration_since(self.snapshot.time).as_millis() as u64;

        if dt_ms > 0 {
            let prev = self.snapshot;
            self.monitor.count("capacity-busy", prev.busy as u64 * dt_ms);
            self.monitor.count("capacity-idle", prev.idle as u64 * dt_ms);

            for &k in &THRESHOLDS {
                if k == 0 {
                    if prev.busy == 0 {
                        self.monitor.count("running-eq-0", dt_ms);
                    }
                    if prev.idle == 0 {
                        self.monitor.count("idle-eq-0", dt_ms);
                    }
                } else {
                    if prev.busy >= k {
                        self.monitor.count(&format!("running-ge-{}", k), dt_ms);
                    }
                    if prev.idle >= k {
                        self.monitor.count(&format!("idle-ge-{}", k), dt_ms);
                    }
                }
            }
        }

        self.snapshot = CapacitySnapshot {
            idle,
            busy,
            time: now,
        };
    }

    /// Measures how much of the paid-for capacity actually ran tasks:
    /// completed run time plus the elapsed time of still-running tasks,
    /// over capacity × billed uptime.
    pub fn measure_efficiency(
        &self,
        total_run_time_ms: u64,
        running_elapsed_ms: u64,
        capacity: u32,
        billing_uptime_seconds: u64,
    ) {
        let denominator = capacity as f64 * billing_uptime_seconds as f64 * 1000.0;
        if denominator <= 0.0 {
            // Capacity is zeroed during a graceful drain; there is nothing
            // meaningful to report.
            debug!("Skipping efficiency measure, no billable capacity");
            return;
        }

        let used_ms = total_run_time_ms.saturating_add(running_elapsed_ms);
        let efficiency = used_ms as f64 / denominator * 100.0;

        info!(
            efficiency,
            used_ms, capacity, billing_uptime_seconds, "Worker efficiency"
        );
        self.monitor.measure("total-efficiency", efficiency);
    }
}
