//! Configuration management for the job execution worker
//!
//! This module handles loading and validation of the worker configuration
//! file (worker.toml) and the application of command-line overrides.

use anyhow::{Context, Result};
use shared::config::WorkerConfig;
use std::path::PathBuf;
use tracing::{debug, info};

/// Configuration file name is defined as a constant to avoid magic strings
/// and make it easier to change in one place if needed.
const WORKER_CONFIG_FILE: &str = "worker.toml";

/// Manages worker configuration loading and validation.
pub struct ConfigManager {
    /// Directory containing configuration files.
    pub config_dir: PathBuf,
    /// Loaded worker configuration, wrapped in an Option to represent the
    /// unloaded state.
    pub config: Option<WorkerConfig>,
}

impl ConfigManager {
    /// Create a new configuration manager.
    ///
    /// Performs essential validations to ensure the path exists and is a
    /// directory, failing early if the basic requirements are not met.
    pub fn new(config_dir: PathBuf) -> Result<Self> {
        if !config_dir.exists() {
            return Err(anyhow::anyhow!(
                "Configuration directory does not exist: {}",
                config_dir.display()
            ));
        }

        if !config_dir.is_dir() {
            return Err(anyhow::anyhow!(
                "Configuration path is not a directory: {}",
                config_dir.display()
            ));
        }

        Ok(Self {
            config_dir,
            config: None,
        })
    }

    /// Load the configuration file from disk, parse, and validate it.
    pub async fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading worker configuration from {}",
            self.config_dir.display()
        );

        let config_path = self.config_dir.join(WORKER_CONFIG_FILE);
        let toml_content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config = WorkerConfig::from_toml(&toml_content).with_context(|| {
            format!(
                "Failed to load worker configuration from {}",
                config_path.display()
            )
        })?;

        // Log all effective configuration parameters at debug level.
        debug!("Worker configuration parameters (including defaults):");
        debug!("  worker_id: {}", config.worker_id);
        debug!("  queue_url: {}", config.queue_url);
        debug!(
            "  api_key: {}",
            if config.api_key.is_empty() {
                "<empty>"
            } else {
                "<redacted>"
            }
        );
        debug!("  task_capacity: {}", config.task_capacity);
        debug!("  poll_interval_ms: {}", config.poll_interval_ms);
        debug!("  restrict_cpu: {}", config.restrict_cpu);
        debug!("  devices: {:?}", config.devices);
        debug!("  work_volume: {}", config.work_volume.display());
        debug!("  min_diskspace_bytes: {}", config.min_diskspace_bytes);
        debug!("  cache_dir: {}", config.cache_dir.display());
        debug!("  cache_max_bytes: {}", config.cache_max_bytes);
        debug!("  gc_min_age_seconds: {}", config.gc_min_age_seconds);
        debug!(
            "  capacity_report_interval_seconds: {}",
            config.capacity_report_interval_seconds
        );
        debug!(
            "  idle_shutdown_timeout_seconds: {}",
            config.idle_shutdown_timeout_seconds
        );
        debug!(
            "  cancellation_poll_interval_seconds: {}",
            config.cancellation_poll_interval_seconds
        );
        debug!("  channel_buffer_size: {}", config.channel_buffer_size);
        debug!(
            "  http_client_timeout_seconds: {}",
            config.http_client_timeout_seconds
        );

        self.config = Some(config);
        Ok(())
    }

    /// Apply command-line overrides on top of the loaded configuration and
    /// re-validate the result.
    pub fn apply_overrides(
        &mut self,
        worker_id: Option<String>,
        queue_url: Option<String>,
        api_key: Option<String>,
        capacity: Option<u32>,
    ) -> Result<()> {
        let config = self
            .config
            .as_mut()
            .expect("Worker configuration not loaded. Call load_config() first.");

        if let Some(worker_id) = worker_id {
            info!("Worker ID override provided via command line");
            config.worker_id = worker_id;
        }
        if let Some(queue_url) = queue_url {
            info!("Queue URL override provided via command line");
            config.queue_url = queue_url;
        }
        if let Some(api_key) = api_key {
            info!("API key override provided via command line");
            config.api_key = api_key;
        }
        if let Some(capacity) = capacity {
            info!("Task capacity override provided via command line");
            config.task_capacity = capacity;
        }

        config
            .validate()
            .context("Validation failed after applying command-line overrides")
    }

    /// The loaded configuration.
    pub fn config(&self) -> &WorkerConfig {
        self.config
            .as_ref()
            .expect("Worker configuration not loaded. Call load_config() first.")
    }
}
