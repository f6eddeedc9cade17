//! Lifecycle event types emitted by the worker
//!
//! Every significant transition in a worker's life produces one of these
//! records: instance boot, readiness, per-task queue/start/finish, and the
//! final shutdown pair. Events are serialized with camelCase field names so
//! that downstream log pipelines see the same shape the queue uses.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The kind of lifecycle transition an event records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    /// The claimed task was queued (timestamped at task creation)
    TaskQueue,
    /// Handler execution is about to begin
    TaskStart,
    /// Handler execution returned, successfully or not
    TaskFinish,
    /// The host instance booted (timestamped at boot, not at emission)
    InstanceBoot,
    /// The worker finished startup and is polling for work
    WorkerReady,
    /// The worker is shutting the instance down
    InstanceShutdown,
    /// The worker process is exiting
    Exit,
}

/// One lifecycle event record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub event_type: EventType,
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Creates a worker-scoped event timestamped now.
    pub fn new(event_type: EventType, worker_id: &str) -> Self {
        Self {
            event_type,
            worker_id: worker_id.to_string(),
            task_id: None,
            run_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a task-scoped event timestamped now.
    pub fn for_task(event_type: EventType, worker_id: &str, task_id: &str, run_id: u32) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            run_id: Some(run_id),
            ..Self::new(event_type, worker_id)
        }
    }

    /// Replaces the timestamp, for events that record a moment in the past
    /// (task creation, instance boot).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Shifts the timestamp back by the given number of seconds.
    pub fn seconds_ago(self, seconds: u64) -> Self {
        let ts = Utc::now() - Duration::seconds(seconds as i64);
        self.at(ts)
    }
}
