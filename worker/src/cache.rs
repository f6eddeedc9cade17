//! Volume cache maintenance
//!
//! Tasks may populate cached volumes that outlive a single run. Before a
//! cycle admits new claims it asks the cache to purge itself back under its
//! size budget, oldest entries first.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Cache of reusable task volumes.
#[async_trait]
pub trait VolumeCache: Send + Sync {
    /// Evicts cache entries until the cache is back under budget.
    async fn purge_caches(&self);
}

/// Volume cache backed by a directory of cached volumes, trimmed to a byte
/// budget by evicting the least recently touched entries.
pub struct DirVolumeCache {
    root: PathBuf,
    max_bytes: u64,
}

impl DirVolumeCache {
    pub fn new(root: PathBuf, max_bytes: u64) -> Self {
        Self { root, max_bytes }
    }
}

/// Total size in bytes of everything under `path`.
async fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }

    total
}

#[async_trait]
impl VolumeCache for DirVolumeCache {
    async fn purge_caches(&self) {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(root = %self.root.display(), "Cache purge failed to list entries: {}", e);
                return;
            }
        };

        // Collect (path, mtime, size) for every cache entry.
        let mut cached: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let size = dir_size(&path).await;
            cached.push((path, modified, size));
        }

        let mut total: u64 = cached.iter().map(|(_, _, size)| size).sum();
        if total <= self.max_bytes {
            debug!(total, budget = self.max_bytes, "Volume cache within budget");
            return;
        }

        // Oldest entries go first.
        cached.sort_by_key(|(_, modified, _)| *modified);

        for (path, _, size) in cached {
            if total <= self.max_bytes {
                break;
            }
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    total = total.saturating_sub(size);
                    debug!(path = %path.display(), size, "Purged cached volume");
                }
                Err(e) => warn!(path = %path.display(), "Failed to purge cached volume: {}", e),
            }
        }
    }
}
