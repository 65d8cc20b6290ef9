//! The content-addressable file cache facade: coordinates the storage map,
//! LRU list, directory storage, directories index, lock map and optional
//! delegate behind one `Cache` handle. A single `Arc`-wrapped `Inner` struct
//! cloned cheaply per caller, with the actual operations split across
//! sibling modules (`write`, `eviction`, `materialize`, `read`, `startup`)
//! that each add an `impl Cache` block — the struct is one thing, the
//! behavior is organized by concern.

use crate::delegate::Delegate;
use crate::digest::{Digest, DigestUtil};
use crate::directories_index::{
    DirectoriesIndex, FileDirectoriesIndex, MemoryDirectoriesIndex, SqliteDirectoriesIndex,
};
use crate::entry::LruList;
use crate::errors::DirectoriesIndexError;
use crate::key::{BlobKey, DirectoryKey};
use crate::write::WriteId;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

/// Positive-cache TTL for on-disk existence checks (`Entry::exists_deadline`
/// and the analogous per-directory check).
pub const EXISTS_CACHE_TTL: Duration = Duration::from_secs(10);

/// Selects a [DirectoriesIndex] backend at construction time.
pub enum DirectoriesIndexBackend {
    Memory,
    /// One file per directory under the cache root.
    File,
    /// SQLite-backed; `None` opens an ephemeral `:memory:` database, `Some`
    /// opens (and recreates) a database file at that path.
    Sqlite(Option<PathBuf>),
}

/// Construction parameters for [Cache]. All fields are required except the
/// hooks and the delegate, which default to none.
pub struct CacheConfig {
    pub root: PathBuf,
    pub max_size_bytes: u64,
    pub max_entry_size_bytes: u64,
    pub directories_index_backend: DirectoriesIndexBackend,
    pub digest_util: Arc<dyn DigestUtil>,
    pub delegate: Option<Arc<dyn Delegate>>,
    /// Idle time after which an in-flight write's registry entry is eligible
    /// for reaping. Does not affect the on-disk partial file, only the
    /// bookkeeping `reap_idle_writes` consults.
    pub write_idle_ttl: Duration,
    pub on_put: Option<Arc<dyn Fn(&Digest) + Send + Sync>>,
    pub on_put_all: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_expire: Option<Arc<dyn Fn(&Digest) + Send + Sync>>,
}

impl CacheConfig {
    pub fn new(
        root: impl Into<PathBuf>,
        max_size_bytes: u64,
        max_entry_size_bytes: u64,
        digest_util: Arc<dyn DigestUtil>,
    ) -> Self {
        Self {
            root: root.into(),
            max_size_bytes,
            max_entry_size_bytes,
            directories_index_backend: DirectoriesIndexBackend::Memory,
            digest_util,
            delegate: None,
            write_idle_ttl: Duration::from_secs(60),
            on_put: None,
            on_put_all: None,
            on_expire: None,
        }
    }
}

pub(crate) struct DirectoryEntry {
    pub root: PathBuf,
    pub exists_deadline: Option<Instant>,
}

/// All cache-monitor-guarded state: the storage map, the LRU list, the live
/// byte total, and directory storage. One coarse lock: the hot path is
/// hard-link installation, not list mutation (see DESIGN.md).
pub(crate) struct State {
    pub storage: HashMap<BlobKey, usize>,
    pub lru: LruList,
    pub size_in_bytes: u64,
    pub directory_storage: HashMap<DirectoryKey, DirectoryEntry>,
    pub evicted_count: u64,
    pub evicted_size: u64,
}

impl State {
    fn new() -> Self {
        Self {
            storage: HashMap::new(),
            lru: LruList::new(),
            size_in_bytes: 0,
            directory_storage: HashMap::new(),
            evicted_count: 0,
            evicted_size: 0,
        }
    }
}

/// Observability snapshot: the cache's individual accessors bundled into one
/// struct, convenient for a single periodic log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size_in_bytes: u64,
    pub entry_count: usize,
    pub unreferenced_entry_count: usize,
    pub directory_storage_count: usize,
    pub evicted_count: u64,
    pub evicted_size: u64,
}

pub(crate) struct Inner {
    pub root: PathBuf,
    pub max_size_bytes: u64,
    pub max_entry_size_bytes: u64,
    pub digest_util: Arc<dyn DigestUtil>,
    pub directories_index: Arc<dyn DirectoriesIndex>,
    pub delegate: Option<Arc<dyn Delegate>>,
    pub state: SyncMutex<State>,
    /// Woken on any decrement-to-zero or eviction completion; consulted by
    /// `wait_for_last_unreferenced`.
    pub notify: Notify,
    pub lock_map: crate::lockmap::LockMap<DirectoryKey>,
    pub on_put: Option<Arc<dyn Fn(&Digest) + Send + Sync>>,
    pub on_put_all: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_expire: Option<Arc<dyn Fn(&Digest) + Send + Sync>>,
    pub access_tx: mpsc::Sender<usize>,
    pub write_registry: SyncMutex<HashMap<(BlobKey, WriteId), Instant>>,
    pub write_idle_ttl: Duration,
}

/// The public cache handle. Cheap to clone; every clone shares the same
/// underlying state.
#[derive(Clone)]
pub struct Cache(pub(crate) Arc<Inner>);

impl Cache {
    /// Constructs a [Cache] over `config.root`, without performing the
    /// startup rescan — call [Cache::start] separately, keeping construction
    /// separate from any I/O-bound warm-up.
    pub fn new(config: CacheConfig) -> Result<Self, DirectoriesIndexError> {
        let directories_index: Arc<dyn DirectoriesIndex> = match config.directories_index_backend {
            DirectoriesIndexBackend::Memory => Arc::new(MemoryDirectoriesIndex::new()),
            DirectoriesIndexBackend::File => {
                Arc::new(FileDirectoriesIndex::new(config.root.clone()))
            }
            DirectoriesIndexBackend::Sqlite(Some(path)) => {
                Arc::new(SqliteDirectoriesIndex::new(path)?)
            }
            DirectoriesIndexBackend::Sqlite(None) => {
                Arc::new(SqliteDirectoriesIndex::new_in_memory()?)
            }
        };

        // Access-recorder channel: touches are submitted from hot paths
        // without blocking on the state lock's contention; a background
        // task drains them. A bounded channel plus `try_send` means
        // rejected submissions are logged but non-fatal.
        let (access_tx, mut access_rx) = mpsc::channel::<usize>(1024);

        let inner = Arc::new(Inner {
            root: config.root,
            max_size_bytes: config.max_size_bytes,
            max_entry_size_bytes: config.max_entry_size_bytes,
            digest_util: config.digest_util,
            directories_index,
            delegate: config.delegate,
            state: SyncMutex::new(State::new()),
            notify: Notify::new(),
            lock_map: crate::lockmap::LockMap::new(),
            on_put: config.on_put,
            on_put_all: config.on_put_all,
            on_expire: config.on_expire,
            access_tx,
            write_registry: SyncMutex::new(HashMap::new()),
            write_idle_ttl: config.write_idle_ttl,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(idx) = access_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.state.lock().lru.touch(idx);
            }
        });

        Ok(Self(inner))
    }

    pub(crate) fn path_for_key(&self, key: &BlobKey) -> PathBuf {
        self.0.root.join(key.to_string())
    }

    pub(crate) fn path_for_directory(&self, key: &DirectoryKey) -> PathBuf {
        self.0.root.join(key.to_string())
    }

    /// Submits an LRU touch to the access recorder (best-effort).
    pub(crate) fn record_access(&self, idx: usize) {
        if self.0.access_tx.try_send(idx).is_err() {
            tracing::debug!("access recorder channel full; dropping touch");
        }
    }

    /// True if present locally under either executable variant, or
    /// recursively in the delegate. Records an access if local.
    #[tracing::instrument(skip(self), fields(digest = %digest))]
    pub async fn contains(&self, digest: &Digest) -> bool {
        if digest.is_empty() {
            return true;
        }
        for executable in [false, true] {
            let key = BlobKey::new(digest, executable);
            let idx = {
                let state = self.0.state.lock();
                state.storage.get(&key).copied()
            };
            if let Some(idx) = idx {
                self.record_access(idx);
                return true;
            }
        }
        if let Some(delegate) = &self.0.delegate {
            return delegate.has(digest).await.unwrap_or(false);
        }
        false
    }

    /// Subset of `digests` not present locally; accesses are recorded for
    /// found ones, the missing subset is forwarded to the delegate if
    /// configured.
    #[tracing::instrument(skip(self, digests))]
    pub async fn find_missing(&self, digests: &[Digest]) -> Vec<Digest> {
        let mut missing = Vec::new();
        for digest in digests {
            if digest.is_empty() {
                continue;
            }
            let mut found = false;
            for executable in [false, true] {
                let key = BlobKey::new(digest, executable);
                let idx = {
                    let state = self.0.state.lock();
                    state.storage.get(&key).copied()
                };
                if let Some(idx) = idx {
                    self.record_access(idx);
                    found = true;
                    break;
                }
            }
            if !found {
                missing.push(digest.clone());
            }
        }

        if missing.is_empty() {
            return missing;
        }
        let Some(delegate) = &self.0.delegate else {
            return missing;
        };
        let mut still_missing = Vec::with_capacity(missing.len());
        for digest in missing {
            if !delegate.has(&digest).await.unwrap_or(false) {
                still_missing.push(digest);
            }
        }
        still_missing
    }

    /// Atomically decrements references for a batch of inputs (typically an
    /// action's inputs after execution) —
    /// both directly-named blob-keys and every blob-key a named directory's
    /// materialization used (looked up via the directories index, since the
    /// caller only knows the directory digest, not its flattened inputs).
    /// Notifies waiters on any new zero-count entries.
    #[tracing::instrument(skip(self, blob_keys, directory_digests))]
    pub async fn decrement_references(&self, blob_keys: &[BlobKey], directory_digests: &[Digest]) {
        let mut all_keys: Vec<BlobKey> = blob_keys.to_vec();
        for digest in directory_digests {
            if let Ok(entries) = self.0.directories_index.directory_entries(digest).await {
                all_keys.extend(entries);
            }
        }

        let mut any_zero = false;
        {
            let mut state = self.0.state.lock();
            for key in &all_keys {
                if let Some(&idx) = state.storage.get(key) {
                    if state.lru.decrement_reference(idx) == 0 {
                        any_zero = true;
                    }
                }
            }
        }
        if any_zero {
            self.0.notify.notify_waiters();
        }
    }

    pub fn size(&self) -> u64 {
        self.0.state.lock().size_in_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.0.state.lock().storage.len()
    }

    pub fn unreferenced_entry_count(&self) -> usize {
        self.0.state.lock().lru.iter_lru().count()
    }

    pub fn directory_storage_count(&self) -> usize {
        self.0.state.lock().directory_storage.len()
    }

    pub fn get_evicted_count(&self) -> u64 {
        self.0.state.lock().evicted_count
    }

    pub fn get_evicted_size(&self) -> u64 {
        self.0.state.lock().evicted_size
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.0.state.lock();
        CacheStats {
            size_in_bytes: state.size_in_bytes,
            entry_count: state.storage.len(),
            unreferenced_entry_count: state.lru.iter_lru().count(),
            directory_storage_count: state.directory_storage.len(),
            evicted_count: state.evicted_count,
            evicted_size: state.evicted_size,
        }
    }

    /// Purges [write][crate::write] registry entries idle longer than
    /// `write_idle_ttl`. The embedding worker is expected to call this
    /// periodically; the cache itself runs no background timers beyond the
    /// access recorder.
    pub fn reap_idle_writes(&self) -> usize {
        let mut registry = self.0.write_registry.lock();
        let now = Instant::now();
        let ttl = self.0.write_idle_ttl;
        let before = registry.len();
        registry.retain(|_, last_touch| now.duration_since(*last_touch) < ttl);
        before - registry.len()
    }
}
