//! Startup rescan: reconstructs in-memory state (storage map, LRU, directory
//! storage, directories index) from a pre-existing root, scanning outward
//! from disk rather than ingesting inward from a source tree. Blocking
//! filesystem work runs through `spawn_blocking` from within async
//! orchestration; bounded concurrency (`futures::stream::buffered`, sized to
//! `num_cpus::get()`) caps the scan at a thread-pool-sized fan-out without
//! hand-rolling a thread pool.

use crate::cache::{Cache, DirectoryEntry, EXISTS_CACHE_TTL};
use crate::digest::{Digest, DigestUtil};
use crate::errors::CacheError;
use crate::key::{BlobKey, DirectoryKey};
use crate::tree::{Directory, DirectoryNode, FileNode, Node, SymlinkNode};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info_span, Instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

/// Per-phase counters from one [Cache::start] call: lets the embedding
/// worker log a one-line startup summary instead of just a duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheLoadResults {
    pub files_scanned: usize,
    pub files_accepted: usize,
    pub files_rejected: usize,
    pub bytes_accepted: u64,
    pub directories_scanned: usize,
    pub directories_rebuilt: usize,
    pub directories_discarded: usize,
}

/// Returned by [Cache::start]: the root that was scanned, the counts, and
/// how long the rescan took.
#[derive(Debug, Clone)]
pub struct StartupCacheResults {
    pub root: PathBuf,
    pub results: CacheLoadResults,
    pub duration: Duration,
}

/// Classification of one top-level root entry from Phase Scan, before the
/// sequential fold that actually mutates cache state. Kept free of any
/// access to `Cache` so the concurrent gather stage never contends with the
/// state lock.
enum ScanInfo {
    /// Owned by the [crate::directories_index::DirectoriesIndex] backend's
    /// own on-disk bookkeeping; neither a blob nor a directory tree.
    OwnedByIndex,
    /// Name ends `_dir` and is a directory: queued for Phase Compute.
    DirCandidate { name: String, path: PathBuf },
    /// Name ends `_dir` but isn't a directory: always discarded.
    DirFileConflict { path: PathBuf },
    /// Parses as a blob-key and is a regular file; still subject to the
    /// acceptance checks in Phase Scan's "name is a regular file" step.
    Blob {
        path: PathBuf,
        key: BlobKey,
        size: u64,
        mode_executable: bool,
        dev: u64,
        ino: u64,
    },
    /// Doesn't parse as a blob-key, or isn't a regular file: discarded
    /// (covers both unrecognized names and stray in-flight write files
    /// `{key}.{write_id}`, treated as crash artifacts — cross-restart
    /// dangling-write GC is out of scope).
    Unrecognized { path: PathBuf },
}

async fn scan_entry(
    directories_index: Arc<dyn crate::directories_index::DirectoriesIndex>,
    path: PathBuf,
    name: String,
) -> ScanInfo {
    if directories_index.owns_path(&name) {
        return ScanInfo::OwnedByIndex;
    }

    if name.ends_with("_dir") {
        return match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => ScanInfo::DirCandidate { name, path },
            _ => ScanInfo::DirFileConflict { path },
        };
    }

    let Some(key) = BlobKey::parse(&name) else {
        return ScanInfo::Unrecognized { path };
    };

    match tokio::fs::symlink_metadata(&path).await {
        Ok(meta) if meta.is_file() => {
            use std::os::unix::fs::{MetadataExt, PermissionsExt};
            ScanInfo::Blob {
                path,
                key,
                size: meta.len(),
                mode_executable: meta.permissions().mode() & 0o111 != 0,
                dev: meta.dev(),
                ino: meta.ino(),
            }
        }
        _ => ScanInfo::Unrecognized { path },
    }
}

/// Synchronously rebuilds a [Directory] from an on-disk materialized tree,
/// resolving each regular file to the blob-key it was hard-linked from via
/// `(dev, ino)` lookup in `blob_index` — the same
/// identity the scan phase recorded each accepted blob's cache file under.
/// Accumulates the flattened, sorted-by-name input list into `inputs` as it
/// goes, matching the order [crate::materialize::Cache::put_directory]
/// would have produced it in originally.
fn build_directory_sync(
    path: &Path,
    blob_index: &HashMap<(u64, u64), BlobKey>,
    digest_util: &dyn DigestUtil,
    inputs: &mut Vec<BlobKey>,
) -> std::io::Result<Directory> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let mut dir = Directory::new();
    let mut entries: Vec<_> = std::fs::read_dir(path)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let entry_path = entry.path();
        let meta = std::fs::symlink_metadata(&entry_path)?;

        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&entry_path)?;
            dir.insert(
                name,
                Node::Symlink(SymlinkNode {
                    target: target.to_string_lossy().into_owned(),
                }),
            );
        } else if meta.is_dir() {
            let child = build_directory_sync(&entry_path, blob_index, digest_util, inputs)?;
            let child_digest = crate::tree::compute_directory_digest(&child, digest_util);
            dir.insert(name, Node::Directory(DirectoryNode { digest: child_digest }));
        } else if meta.len() == 0 {
            let executable = meta.permissions().mode() & 0o111 != 0;
            dir.insert(
                name,
                Node::File(FileNode {
                    digest: digest_util.empty(),
                    executable,
                }),
            );
        } else {
            let key = blob_index
                .get(&(meta.dev(), meta.ino()))
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("{} is not a known cache blob", entry_path.display()),
                    )
                })?
                .clone();
            let digest = Digest::build(key.hash(), key.size()).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?;
            let executable = key.executable();
            inputs.push(key);
            dir.insert(name, Node::File(FileNode { digest, executable }));
        }
    }

    Ok(dir)
}

/// Rebuilds one `_dir` candidate and verifies its digest against the name it
/// was filed under. `None` on any mismatch or I/O failure; the caller
/// schedules the tree for deletion in that case.
async fn compute_one_directory(
    dir_name: String,
    path: PathBuf,
    blob_index: Arc<HashMap<(u64, u64), BlobKey>>,
    digest_util: Arc<dyn DigestUtil>,
) -> Option<(Digest, Vec<BlobKey>)> {
    let expected_key = DirectoryKey::parse(&dir_name)?;
    let expected = Digest::build(expected_key.hash(), expected_key.size()).ok()?;

    tokio::task::spawn_blocking(move || {
        let mut inputs = Vec::new();
        let directory =
            build_directory_sync(&path, &blob_index, digest_util.as_ref(), &mut inputs).ok()?;
        let digest = crate::tree::compute_directory_digest(&directory, digest_util.as_ref());
        if digest == expected {
            Some((digest, inputs))
        } else {
            None
        }
    })
    .await
    .ok()
    .flatten()
}

/// Removes whatever is at `path`, regardless of whether it turned out to be
/// a plain file or a directory tree — Phase Scan's rejects and Phase
/// Compute's digest-mismatched trees are deleted the same way.
async fn delete_path(path: &Path) {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            if let Err(e) = crate::fsutil::remove_tree(path.to_path_buf()).await {
                tracing::warn!(path = %path.display(), error = %e, "startup: failed to remove rejected directory tree");
            }
        }
        Ok(_) => {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!(path = %path.display(), error = %e, "startup: failed to remove rejected file");
            }
        }
        Err(_) => {}
    }
}

impl Cache {
    /// `skip_load = true` discards whatever is on disk and starts from an
    /// empty root; otherwise performs the full three-phase rescan (Scan,
    /// Compute, Delete) before starting the directories index.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, skip_load: bool) -> Result<StartupCacheResults, CacheError> {
        let started = Instant::now();
        let root = self.0.root.clone();

        if skip_load {
            crate::fsutil::remove_tree(root.clone()).await?;
            tokio::fs::create_dir_all(&root).await?;
            self.0.directories_index.start().await?;
            return Ok(StartupCacheResults {
                root,
                results: CacheLoadResults::default(),
                duration: started.elapsed(),
            });
        }

        tokio::fs::create_dir_all(&root).await?;
        let results = self.rescan(&root).await?;
        self.0.directories_index.start().await?;

        Ok(StartupCacheResults {
            root,
            results,
            duration: started.elapsed(),
        })
    }

    async fn rescan(&self, root: &Path) -> Result<CacheLoadResults, CacheError> {
        let concurrency = num_cpus::get().max(1);

        let mut names: Vec<(String, PathBuf)> = Vec::new();
        let mut rd = tokio::fs::read_dir(root).await?;
        while let Some(entry) = rd.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            names.push((name, entry.path()));
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let scan_span = info_span!("scan cache root", "indicatif.pb_show" = tracing::field::Empty);
        scan_span.pb_set_length(names.len() as u64);
        scan_span.pb_set_style(&cafc_tracing::PB_PROGRESS_STYLE);
        scan_span.pb_start();

        let directories_index = self.0.directories_index.clone();
        let scan_results: Vec<ScanInfo> = stream::iter(names.into_iter())
            .map(|(name, path)| {
                let directories_index = directories_index.clone();
                async move {
                    let info = scan_entry(directories_index, path, name).await;
                    Span::current().pb_inc(1);
                    info
                }
            })
            .buffered(concurrency)
            .collect()
            .instrument(scan_span)
            .await;

        let mut results = CacheLoadResults::default();
        let mut blob_index: HashMap<(u64, u64), BlobKey> = HashMap::new();
        let mut dir_candidates: Vec<(String, PathBuf)> = Vec::new();
        let mut to_delete: Vec<PathBuf> = Vec::new();

        {
            let mut state = self.0.state.lock();
            for info in scan_results {
                match info {
                    ScanInfo::OwnedByIndex => {}
                    ScanInfo::DirCandidate { name, path } => {
                        results.directories_scanned += 1;
                        dir_candidates.push((name, path));
                    }
                    ScanInfo::DirFileConflict { path } => {
                        results.directories_scanned += 1;
                        results.directories_discarded += 1;
                        to_delete.push(path);
                    }
                    ScanInfo::Unrecognized { path } => {
                        results.files_scanned += 1;
                        results.files_rejected += 1;
                        to_delete.push(path);
                    }
                    ScanInfo::Blob {
                        path,
                        key,
                        size,
                        mode_executable,
                        dev,
                        ino,
                    } => {
                        results.files_scanned += 1;
                        let accept = size > 0
                            && size == key.size()
                            && mode_executable == key.executable()
                            && key.size() <= self.0.max_entry_size_bytes
                            && state.size_in_bytes.saturating_add(size) <= self.0.max_size_bytes;

                        if accept {
                            let idx = state.lru.insert(key.clone(), size);
                            state.lru.decrement_reference(idx);
                            state.storage.insert(key.clone(), idx);
                            state.size_in_bytes += size;
                            blob_index.insert((dev, ino), key);
                            results.files_accepted += 1;
                            results.bytes_accepted += size;
                        } else {
                            results.files_rejected += 1;
                            to_delete.push(path);
                        }
                    }
                }
            }
        }

        let blob_index = Arc::new(blob_index);
        let digest_util = self.0.digest_util.clone();
        let dir_outcomes: Vec<(PathBuf, Option<(Digest, Vec<BlobKey>)>)> =
            stream::iter(dir_candidates.into_iter())
                .map(|(name, path)| {
                    let blob_index = blob_index.clone();
                    let digest_util = digest_util.clone();
                    async move {
                        let outcome =
                            compute_one_directory(name, path.clone(), blob_index, digest_util)
                                .await;
                        (path, outcome)
                    }
                })
                .buffered(concurrency)
                .collect()
                .await;

        for (path, outcome) in dir_outcomes {
            match outcome {
                Some((digest, inputs)) => {
                    if let Err(e) = self
                        .0
                        .directories_index
                        .put(digest.clone(), inputs)
                        .await
                    {
                        tracing::warn!(directory = %digest, error = %e, "startup: failed to index rebuilt directory");
                        to_delete.push(path);
                        results.directories_discarded += 1;
                        continue;
                    }
                    let dir_key = DirectoryKey::new(&digest);
                    let mut state = self.0.state.lock();
                    state.directory_storage.insert(
                        dir_key,
                        DirectoryEntry {
                            root: path,
                            exists_deadline: Some(Instant::now() + EXISTS_CACHE_TTL),
                        },
                    );
                    results.directories_rebuilt += 1;
                }
                None => {
                    results.directories_discarded += 1;
                    to_delete.push(path);
                }
            }
        }

        stream::iter(to_delete.iter())
            .for_each_concurrent(concurrency, |path| delete_path(path))
            .await;

        Ok(results)
    }
}
