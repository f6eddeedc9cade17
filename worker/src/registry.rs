//! Registry of in-flight tasks
//!
//! One [`RunningState`] exists per claimed run from admission until
//! retirement. The registry is owned by the worker loop; spawned runners
//! never touch it directly, they report completion over a channel and the
//! loop mutates the registry on their behalf.

use crate::devices::Device;
use crate::handler::TaskHandler;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Bookkeeping for one in-flight task run.
pub struct RunningState {
    pub task_id: String,
    pub run_id: u32,
    /// When the run was admitted.
    pub start_time: Instant,
    /// Device leases held for the lifetime of the run, keyed by kind.
    pub devices: HashMap<String, Box<dyn Device>>,
    /// Controller driving the run.
    pub handler: Arc<dyn TaskHandler>,
}

impl RunningState {
    /// Releases every device lease held by this state. Safe to call more
    /// than once; device release is idempotent.
    pub fn release_devices(&self) {
        for device in self.devices.values() {
            device.release();
        }
    }
}

/// Unordered collection of running states addressable by (task id, run id).
#[derive(Default)]
pub struct RunningRegistry {
    entries: Vec<RunningState>,
}

impl RunningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a state. The caller checks for duplicates with [`find`]
    /// before admission; a duplicate slipping through is rejected here and
    /// handed back.
    ///
    /// [`find`]: RunningRegistry::find
    pub fn add(&mut self, state: RunningState) -> Option<RunningState> {
        if self.find(&state.task_id, state.run_id).is_some() {
            warn!(
                task_id = %state.task_id,
                run_id = state.run_id,
                "Refusing duplicate registry entry"
            );
            return Some(state);
        }
        self.entries.push(state);
        None
    }

    /// Removes and returns the state for (task id, run id), if present.
    pub fn remove(&mut self, task_id: &str, run_id: u32) -> Option<RunningState> {
        let index = self
            .entries
            .iter()
            .position(|s| s.task_id == task_id && s.run_id == run_id)?;
        Some(self.entries.swap_remove(index))
    }

    pub fn find(&self, task_id: &str, run_id: u32) -> Option<&RunningState> {
        self.entries
            .iter()
            .find(|s| s.task_id == task_id && s.run_id == run_id)
    }

    /// All current entries.
    pub fn snapshot(&self) -> &[RunningState] {
        &self.entries
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
