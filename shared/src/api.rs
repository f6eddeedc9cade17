//! Queue API types for worker-queue communication
//!
//! This module defines the wire types exchanged between the worker and the
//! central queue: work claims, task status records, cancellation messages,
//! and the claim-work request/response pair. The queue API uses camelCase
//! field names, so every wire struct carries a `rename_all` attribute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolution reason reported for a run that was canceled by the queue.
pub const REASON_CANCELED: &str = "canceled";

/// API endpoint paths on the central queue
pub mod endpoints {
    pub const CLAIM_WORK: &str = "/api/v1/claim-work";
    pub const CANCELLATIONS: &str = "/api/v1/cancellations";
}

/// HTTP header names used for queue authentication
pub mod headers {
    pub const API_KEY: &str = "X-API-Key";
    pub const WORKER_ID: &str = "X-Worker-ID";
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// A queue grant of the exclusive right to execute one run of one task
/// for a bounded lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    /// Current status record of the claimed task
    pub status: TaskStatus,
    /// The run this claim grants
    #[serde(rename = "runId")]
    pub run_id: u32,
    /// The task definition to execute
    pub task: Task,
}

/// Status record of a task as reported by the queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// Unique identifier of the task
    pub task_id: String,
    /// Runs recorded so far; empty when the claim grants the first run
    #[serde(default)]
    pub runs: Vec<RunInfo>,
}

/// One numbered attempt at executing a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: u32,
    /// Queue-side state of the run (e.g. "running", "completed")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Why the run reached its resolved state, when it has
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_resolved: Option<String>,
}

/// Task definition as stored by the queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// When the task was created on the queue
    pub created: DateTime<Utc>,
    /// Opaque execution payload; the worker core only inspects capabilities
    pub payload: TaskPayload,
}

/// Execution payload of a task.
///
/// The worker core treats the payload as opaque apart from the device
/// capabilities; the remaining fields are consumed by the task handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    /// Command and arguments the handler executes
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables for the handler process
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Host capabilities the task requires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    /// Maximum run time in seconds before the handler gives up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_run_time: Option<u64>,
    /// Payload fields the core does not interpret
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Host capabilities requested by a task payload
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Capabilities {
    /// Devices the task needs, keyed by device kind. The value is an
    /// opaque per-kind option blob; the worker only leases by kind.
    #[serde(default)]
    pub devices: HashMap<String, serde_json::Value>,
}

/// Request body for POST /api/v1/claim-work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimWorkRequest {
    pub worker_id: String,
    /// Maximum number of claims the worker can accept right now
    pub n_tasks: u32,
}

/// Response body for POST /api/v1/claim-work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimWorkResponse {
    #[serde(default)]
    pub claims: Vec<Claim>,
}

/// Cancellation message delivered to the worker.
///
/// The worker acts on the message only when the referenced run resolved
/// with reason [`REASON_CANCELED`]; every other resolution is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelMessage {
    pub payload: CancelPayload,
}

/// Payload of a cancellation message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    pub run_id: u32,
    pub status: TaskStatus,
}

/// Response body for GET /api/v1/cancellations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationsResponse {
    #[serde(default)]
    pub messages: Vec<CancelMessage>,
}

impl CancelMessage {
    /// Returns the resolution reason of the run this message refers to,
    /// when the status record carries it.
    pub fn reason_resolved(&self) -> Option<&str> {
        self.payload
            .status
            .runs
            .iter()
            .find(|r| r.run_id == self.payload.run_id)
            .and_then(|r| r.reason_resolved.as_deref())
    }
}
