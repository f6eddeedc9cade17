//! Disk pressure probing for the work volume
//!
//! Before claiming work the worker checks that the volume holding task work
//! directories has room for the tasks it is about to admit. The production
//! probe reads free space via `sysinfo`; tests substitute a scripted probe.

use anyhow::Result;
use std::path::Path;
use sysinfo::Disks;
use tracing::{debug, warn};

/// Predicate over free disk space on the volume that hosts task work.
pub trait DiskProbe: Send + Sync {
    /// Returns true when the volume does not have `threshold_bytes` free
    /// per admissible task, i.e. admitting `admissible` more tasks would
    /// risk filling the disk.
    fn exceeds_threshold(&self, volume: &Path, threshold_bytes: u64, admissible: u32)
        -> Result<bool>;
}

/// Disk probe backed by the host's mounted-disk table.
pub struct SysinfoDiskProbe;

impl SysinfoDiskProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SysinfoDiskProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskProbe for SysinfoDiskProbe {
    fn exceeds_threshold(
        &self,
        volume: &Path,
        threshold_bytes: u64,
        admissible: u32,
    ) -> Result<bool> {
        // Mount points are absolute, so a relative volume path has to be
        // resolved before prefix matching.
        let volume = volume
            .canonicalize()
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default().join(volume));

        let disks = Disks::new_with_refreshed_list();

        // The disk whose mount point is the longest prefix of the volume
        // path is the one the volume lives on.
        let disk = disks
            .list()
            .iter()
            .filter(|d| volume.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| anyhow::anyhow!("no mounted disk contains {}", volume.display()))?;

        let available = disk.available_space();
        let required = threshold_bytes.saturating_mul(admissible as u64);
        let exceeded = available < required;

        if exceeded {
            warn!(
                volume = %volume.display(),
                available,
                required,
                admissible,
                "Disk pressure: not enough free space for new tasks"
            );
        } else {
            debug!(volume = %volume.display(), available, required, "Disk space ok");
        }

        Ok(exceeded)
    }
}
