//! Shared data structures and utilities for the distributed job worker
//!
//! This crate contains common types used by the worker binary: the queue
//! wire format, worker configuration structures, lifecycle event types,
//! and small validation utilities.

pub mod api;
pub mod config;
pub mod defaults;
pub mod events;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::{Claim, Task, TaskStatus};
pub use config::WorkerConfig;
pub use events::{EventType, LifecycleEvent};
pub use utils::validate_worker_id;

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the worker
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Task execution error: {0}")]
    TaskExecution(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests;
