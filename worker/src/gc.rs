//! Garbage collection of retired task work directories
//!
//! Every poll cycle asks the collector for a sweep: a full sweep when
//! nothing is running (everything on the volume is reclaimable), a light
//! sweep otherwise (only directories old enough that no live task can be
//! writing to them). Sweep failures never disturb the poll loop; they are
//! logged and the next cycle tries again.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Reclaims disk held by finished tasks.
#[async_trait]
pub trait GarbageCollector: Send + Sync {
    /// Performs one sweep. `full` means no task is running and everything
    /// under management may be reclaimed.
    async fn sweep(&self, full: bool);
}

/// Collector that prunes task work directories under the work volume.
pub struct WorkDirGc {
    root: PathBuf,
    /// Light sweeps only remove directories untouched for at least this long.
    min_age: Duration,
}

impl WorkDirGc {
    pub fn new(root: PathBuf, min_age: Duration) -> Self {
        Self { root, min_age }
    }

    async fn remove_dir(&self, path: &PathBuf) {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => debug!(path = %path.display(), "Collected work directory"),
            Err(e) => warn!(path = %path.display(), "Failed to collect work directory: {}", e),
        }
    }
}

#[async_trait]
impl GarbageCollector for WorkDirGc {
    async fn sweep(&self, full: bool) {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(root = %self.root.display(), "GC sweep failed to list volume: {}", e);
                return;
            }
        };

        let now = SystemTime::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            if full {
                self.remove_dir(&path).await;
                continue;
            }

            // A live task keeps its work directory's mtime fresh, so age is
            // the light sweep's in-use signal.
            let age = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok());

            match age {
                Some(age) if age >= self.min_age => self.remove_dir(&path).await,
                _ => {}
            }
        }
    }
}
