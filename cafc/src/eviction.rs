//! Eviction: driven solely by reservations in the write path exceeding the
//! budget. One iteration at a time — pick the LRU front, best-effort write
//! it through the delegate, then atomically remove it and cascade to any
//! directory that referenced it.

use crate::cache::Cache;
use crate::digest::Digest;
use crate::key::{BlobKey, DirectoryKey};
use std::path::PathBuf;
use std::sync::Arc;

impl Cache {
    /// Reserves-and-evicts loop: call after adding `size` to `size_in_bytes`,
    /// runs until the budget is satisfied.
    pub(crate) async fn run_eviction_loop(&self) {
        loop {
            let over_budget = {
                let state = self.0.state.lock();
                state.size_in_bytes > self.0.max_size_bytes
            };
            if !over_budget {
                return;
            }
            self.expire_entry().await;
        }
    }

    /// One eviction iteration. A no-op if the race resolved in the
    /// meantime: the budget already fits, or the chosen candidate got
    /// re-referenced while we were streaming it to the delegate.
    async fn expire_entry(&self) {
        let Some(idx) = self.wait_for_last_unreferenced().await else {
            return;
        };

        let (key, size, path) = {
            let state = self.0.state.lock();
            let entry = state.lru.get(idx);
            (
                entry.key.clone(),
                entry.size,
                self.path_for_key(&entry.key),
            )
        };

        if let Some(delegate) = self.0.delegate.clone() {
            if let Err(e) = write_through(&delegate, &key, &path).await {
                tracing::warn!(key = %key, error = %e, "best-effort delegate write-through failed during eviction");
            }
        }

        let removed_digest = {
            let mut state = self.0.state.lock();
            if state.lru.get(idx).ref_count != 0 {
                // Re-referenced between pick and removal; leave it be and
                // let the caller's loop reassess the budget.
                None
            } else {
                let removed = state.lru.remove(idx);
                state.storage.remove(&removed.key);
                state.size_in_bytes = state.size_in_bytes.saturating_sub(removed.size);
                state.evicted_count += 1;
                state.evicted_size += removed.size;
                Some(Digest::build(removed.key.hash(), removed.key.size()).ok())
            }
        };
        let Some(removed_digest) = removed_digest else {
            return;
        };
        self.0.notify.notify_waiters();

        if let (Some(on_expire), Some(digest)) = (&self.0.on_expire, &removed_digest) {
            on_expire(digest);
        }

        // Cascade directory eviction for everything that referenced this
        // blob-key. Scheduled asynchronously so eviction never blocks on
        // directory-tree removal.
        let directories_index = self.0.directories_index.clone();
        let cache = self.clone();
        let cascade_key = key.clone();
        tokio::spawn(async move {
            match directories_index.remove_entry(&cascade_key).await {
                Ok(digests) => {
                    for digest in digests {
                        cache.evict_directory(digest).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to look up directories referencing evicted blob");
                }
            }
        });

        // Delete the on-disk file, asynchronously.
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete evicted blob file");
                }
            }
        });
    }

    /// Blocks until the LRU list has a candidate and the budget is still
    /// over, or returns `None` if the race resolved (budget now fits after
    /// waking).
    async fn wait_for_last_unreferenced(&self) -> Option<usize> {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            {
                let state = self.0.state.lock();
                if state.size_in_bytes <= self.0.max_size_bytes {
                    return None;
                }
                if let Some(idx) = state.lru.lru_front() {
                    return Some(idx);
                }
            }
            notified.await;
        }
    }

    /// Removes a directory that depended on an evicted blob: the
    /// `DirectoriesIndex` forward mapping, the `DirectoryStorage` entry, and
    /// its on-disk tree. `remove_entry` only ever retracts the *inverse*
    /// mapping for the blob that triggered this; the forward mapping and
    /// on-disk state are this method's job, and it's also what directory
    /// materialization's own stale-entry cleanup reuses.
    pub(crate) async fn evict_directory(&self, digest: Digest) {
        let dir_key = DirectoryKey::new(&digest);
        let removed = {
            let mut state = self.0.state.lock();
            state.directory_storage.remove(&dir_key)
        };
        if let Err(e) = self.0.directories_index.remove(&digest).await {
            tracing::warn!(directory = %dir_key, error = %e, "failed to remove stale directories-index entry");
        }
        if let Some(entry) = removed {
            if let Err(e) = crate::fsutil::remove_tree(entry.root).await {
                tracing::warn!(directory = %dir_key, error = %e, "failed to remove evicted directory tree");
            }
        }
    }
}

async fn write_through(
    delegate: &Arc<dyn crate::delegate::Delegate>,
    key: &BlobKey,
    path: &PathBuf,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let digest = Digest::build(key.hash(), key.size())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut file = tokio::fs::File::open(path).await?;
    let mut writer = delegate.open_write(&digest).await?;
    tokio::io::copy(&mut file, &mut writer).await?;
    writer.shutdown().await?;
    Ok(())
}
