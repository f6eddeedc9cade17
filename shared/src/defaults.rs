//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

use std::path::PathBuf;

/// Default poll interval (5 seconds)
pub fn default_poll_interval_ms() -> u64 {
    5000
}

/// Default capacity report interval (60 seconds)
pub fn default_capacity_report_interval() -> u64 {
    60
}

/// Default cancellation poll interval (10 seconds)
pub fn default_cancellation_poll_interval() -> u64 {
    10
}

/// Default minimum free disk space required per admissible task (10 GiB)
pub fn default_min_diskspace_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

/// Default working volume for task work directories
pub fn default_work_volume() -> PathBuf {
    PathBuf::from("./work")
}

/// Default cache directory for task volume caches
pub fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

/// Default cache size budget (20 GiB)
pub fn default_cache_max_bytes() -> u64 {
    20 * 1024 * 1024 * 1024
}

/// Default minimum age before a retired work directory is collectable (1 hour)
pub fn default_gc_min_age_seconds() -> u64 {
    3600
}

/// Default channel capacity for runner and cancellation messages
pub fn default_channel_buffer_size() -> usize {
    1000
}

/// Default HTTP client timeout for queue communication (30 seconds)
pub fn default_http_client_timeout() -> u64 {
    30
}
