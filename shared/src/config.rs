//! Configuration types and validation for the distributed job worker
//!
//! This module defines the worker configuration structure loaded from
//! worker.toml, including validation logic and serialization support.

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main worker configuration loaded from worker.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Unique identifier for this worker
    pub worker_id: String,
    /// Base URL of the central queue API
    pub queue_url: String,
    /// Pre-shared secret key for queue authentication
    #[serde(default)]
    pub api_key: String,
    /// Number of tasks this worker may run concurrently
    pub task_capacity: u32,
    /// Interval in milliseconds between queue polls (default: 5000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    // Device leasing
    /// Whether each task must hold an exclusive cpu device while running
    #[serde(default)]
    pub restrict_cpu: bool,
    /// Leasable device pools, device kind to slot count (e.g. cpu = 8)
    #[serde(default)]
    pub devices: HashMap<String, u32>,

    // Disk management
    /// Volume that holds task work directories
    #[serde(default = "default_work_volume")]
    pub work_volume: PathBuf,
    /// Minimum free bytes required on the work volume per admissible task
    /// before the worker claims more work (default: 10 GiB)
    #[serde(default = "default_min_diskspace_bytes")]
    pub min_diskspace_bytes: u64,
    /// Directory holding cached task volumes
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Size budget for the volume cache in bytes (default: 20 GiB)
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    /// Minimum age in seconds before a retired work directory is removed
    /// by a light garbage collection sweep (default: 3600)
    #[serde(default = "default_gc_min_age_seconds")]
    pub gc_min_age_seconds: u64,

    // Reporting
    /// Interval in seconds between capacity reports (default: 60)
    #[serde(default = "default_capacity_report_interval")]
    pub capacity_report_interval_seconds: u64,

    // Shutdown behavior
    /// Raise a graceful shutdown after this many seconds of continuous
    /// idleness; 0 disables idle shutdown (default: 0)
    #[serde(default)]
    pub idle_shutdown_timeout_seconds: u64,

    // Performance tuning
    /// Interval in seconds between cancellation polls (default: 10)
    #[serde(default = "default_cancellation_poll_interval")]
    pub cancellation_poll_interval_seconds: u64,
    /// Channel capacity for runner and cancellation messages (default: 1000)
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// HTTP client timeout for queue communication in seconds (default: 30)
    #[serde(default = "default_http_client_timeout")]
    pub http_client_timeout_seconds: u64,
}

impl WorkerConfig {
    /// Parses and validates a configuration from TOML content.
    pub fn from_toml(toml_content: &str) -> crate::Result<Self> {
        let config: WorkerConfig = toml::from_str(toml_content)
            .map_err(|e| crate::WorkerError::Config(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// The poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        crate::utils::validate_worker_id(&self.worker_id)?;

        if self.queue_url.is_empty() {
            return Err(
                crate::WorkerError::Validation("queue_url cannot be empty".to_string()).into(),
            );
        }
        crate::utils::validate_url(&self.queue_url, false)?;

        if self.api_key.is_empty() {
            return Err(
                crate::WorkerError::Validation("api_key cannot be empty".to_string()).into(),
            );
        }

        if self.task_capacity == 0 {
            return Err(crate::WorkerError::Validation(
                "task_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if self.poll_interval_ms < 100 {
            return Err(crate::WorkerError::Validation(
                "poll_interval_ms must be at least 100".to_string(),
            )
            .into());
        }

        if self.restrict_cpu && !self.devices.contains_key("cpu") {
            return Err(crate::WorkerError::Validation(
                "restrict_cpu requires a cpu device pool (add cpu = <count> under [devices])"
                    .to_string(),
            )
            .into());
        }

        for (kind, count) in &self.devices {
            if kind.is_empty() {
                return Err(crate::WorkerError::Validation(
                    "device kind cannot be empty".to_string(),
                )
                .into());
            }
            if *count == 0 {
                return Err(crate::WorkerError::Validation(format!(
                    "device pool '{}' must have at least 1 slot",
                    kind
                ))
                .into());
            }
        }

        if self.capacity_report_interval_seconds == 0 {
            return Err(crate::WorkerError::Validation(
                "capacity_report_interval_seconds must be at least 1".to_string(),
            )
            .into());
        }

        if self.cancellation_poll_interval_seconds == 0 {
            return Err(crate::WorkerError::Validation(
                "cancellation_poll_interval_seconds must be at least 1".to_string(),
            )
            .into());
        }

        if self.channel_buffer_size == 0 {
            return Err(crate::WorkerError::Validation(
                "channel_buffer_size must be at least 1".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
