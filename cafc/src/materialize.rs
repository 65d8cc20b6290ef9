//! Directory materialization: lays a directory tree down on disk as hard
//! links to cache blobs, referencing existing entries where possible and
//! fetching the rest through the write path. One materialization per
//! directory-digest runs at a time, serialized through
//! [crate::lockmap::LockMap]: reads a [DirectorySource] tree definition and
//! renders it onto the filesystem.

use crate::cache::{Cache, DirectoryEntry};
use crate::digest::Digest;
use crate::errors::MaterializeError;
use crate::key::{BlobKey, DirectoryKey};
use crate::tree::{DirectorySource, Node};
use crate::write::WriteId;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Instant;

impl Cache {
    /// Materializes `digest`'s directory tree, returning its root path. On
    /// any failure, every side effect
    /// (acquired references, partial tree, index entries) is rolled back
    /// and a [MaterializeError::PutDirectory] carrying every underlying
    /// cause is returned.
    #[tracing::instrument(skip(self, source), fields(digest = %digest))]
    pub async fn put_directory(
        &self,
        digest: Digest,
        source: &dyn DirectorySource,
    ) -> Result<PathBuf, MaterializeError> {
        let dir_key = DirectoryKey::new(&digest);
        let _guard = self.0.lock_map.lock(dir_key.clone()).await;

        if let Some(path) = self.try_reuse(&digest, &dir_key).await? {
            return Ok(path);
        }

        self.materialize_fresh(digest, &dir_key, source).await
    }

    /// Reuses an already-materialized, still-verified [DirectoryEntry] if
    /// every one of its recorded inputs is still present. Returns `None` if
    /// there's nothing to reuse (caller falls through to a fresh
    /// materialization).
    async fn try_reuse(
        &self,
        digest: &Digest,
        dir_key: &DirectoryKey,
    ) -> Result<Option<PathBuf>, MaterializeError> {
        let have_entry = {
            let state = self.0.state.lock();
            state.directory_storage.contains_key(dir_key)
        };
        if !have_entry {
            return Ok(None);
        }

        let inputs = self.0.directories_index.directory_entries(digest).await?;
        let mut acquired = Vec::with_capacity(inputs.len());
        let all_present = {
            let mut state = self.0.state.lock();
            let mut ok = true;
            for key in &inputs {
                if let Some(&idx) = state.storage.get(key) {
                    state.lru.increment_reference(idx);
                    acquired.push(key.clone());
                } else {
                    ok = false;
                    break;
                }
            }
            ok
        };

        if !all_present {
            self.decrement_references(&acquired, &[]).await;
            self.evict_stale_directory(digest).await?;
            return Ok(None);
        }

        let path = self.path_for_directory(dir_key);
        if self.verify_directory_exists(dir_key, &path).await {
            return Ok(Some(path));
        }

        self.decrement_references(&acquired, &[]).await;
        self.evict_stale_directory(digest).await?;
        Ok(None)
    }

    /// Positive-cache TTL on the on-disk existence check, mirroring the
    /// per-blob `exists_deadline`.
    async fn verify_directory_exists(&self, dir_key: &DirectoryKey, path: &Path) -> bool {
        let cached = {
            let state = self.0.state.lock();
            state
                .directory_storage
                .get(dir_key)
                .and_then(|e| e.exists_deadline)
                .is_some_and(|deadline| Instant::now() < deadline)
        };
        if cached {
            return true;
        }

        let found = tokio::fs::try_exists(path).await.unwrap_or(false);
        if found {
            let mut state = self.0.state.lock();
            if let Some(entry) = state.directory_storage.get_mut(dir_key) {
                entry.exists_deadline = Some(Instant::now() + crate::cache::EXISTS_CACHE_TTL);
            }
        }
        found
    }

    /// Evicts a stale [DirectoryEntry] the same way eviction does (index
    /// removal, tree removal), so a re-materialization starts from a clean
    /// slate.
    async fn evict_stale_directory(&self, digest: &Digest) -> Result<(), MaterializeError> {
        self.evict_directory(digest.clone()).await;
        Ok(())
    }

    /// Walks `source` from scratch and builds the tree.
    async fn materialize_fresh(
        &self,
        digest: Digest,
        dir_key: &DirectoryKey,
        source: &dyn DirectorySource,
    ) -> Result<PathBuf, MaterializeError> {
        let root = self.path_for_directory(dir_key);
        let mut acquired_keys = Vec::new();
        let mut causes = Vec::new();

        let walk_result = self
            .walk_directory(&digest, &root, source, &mut acquired_keys, &mut causes)
            .await;

        if walk_result.is_ok() && causes.is_empty() {
            if let Err(e) = crate::fsutil::make_tree_readonly(root.clone()).await {
                causes.push(MaterializeError::Io(e));
            }
        }

        // On any failure while building the tree, the whole tree is removed
        // unconditionally, not just the entries that failed — see DESIGN.md.
        if walk_result.is_err() || !causes.is_empty() {
            self.decrement_references(&acquired_keys, &[]).await;
            let _ = crate::fsutil::remove_tree(root).await;
            let _ = self.0.directories_index.remove(&digest).await;
            if let Err(e) = walk_result {
                causes.push(e);
            }
            return Err(MaterializeError::PutDirectory { digest, causes });
        }

        self.0
            .directories_index
            .put(digest.clone(), acquired_keys)
            .await?;

        {
            let mut state = self.0.state.lock();
            state.directory_storage.insert(
                dir_key.clone(),
                DirectoryEntry {
                    root: root.clone(),
                    exists_deadline: Some(Instant::now() + crate::cache::EXISTS_CACHE_TTL),
                },
            );
        }

        Ok(root)
    }

    /// Recursively lays down one directory level, accumulating every
    /// acquired blob-key (the flattened, ordered inputs list for
    /// [crate::directories_index::DirectoriesIndex::put]) and every
    /// per-file failure so the caller can report them all together rather
    /// than stopping at the first one. Boxed to recurse through an `async
    /// fn`.
    fn walk_directory<'a>(
        &'a self,
        digest: &'a Digest,
        path: &'a Path,
        source: &'a dyn DirectorySource,
        acquired_keys: &'a mut Vec<BlobKey>,
        causes: &'a mut Vec<MaterializeError>,
    ) -> Pin<Box<dyn Future<Output = Result<(), MaterializeError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(directory) = source.get(digest).await else {
                return Err(MaterializeError::NotFound(digest.clone()));
            };
            tokio::fs::create_dir_all(path).await?;

            for (name, node) in directory.iter() {
                let entry_path = path.join(name);
                match node {
                    Node::File(file) => {
                        if file.digest.is_empty() {
                            crate::fsutil::create_readonly_file(entry_path, file.executable)
                                .await?;
                            continue;
                        }
                        match self.ensure_blob_present(&file.digest, file.executable).await {
                            Ok(key) => {
                                let cache_path = self.path_for_key(&key);
                                tokio::fs::hard_link(&cache_path, &entry_path).await?;
                                acquired_keys.push(key);
                            }
                            Err(e) => causes.push(e),
                        }
                    }
                    Node::Directory(dir_node) => {
                        self.walk_directory(
                            &dir_node.digest,
                            &entry_path,
                            source,
                            acquired_keys,
                            causes,
                        )
                        .await?;
                    }
                    Node::Symlink(symlink) => {
                        let target = symlink.target.clone();
                        tokio::task::spawn_blocking(move || {
                            std::os::unix::fs::symlink(&target, &entry_path)
                        })
                        .await
                        .map_err(|e| {
                            MaterializeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                        })??;
                    }
                }
            }

            Ok(())
        })
    }

    /// Ensures `digest` (with the given executable bit) is present locally,
    /// referencing it if already cached or fetching it from the delegate
    /// and writing it through the ordinary write path otherwise. Returns the
    /// blob-key holding a live reference on success.
    async fn ensure_blob_present(
        &self,
        digest: &Digest,
        executable: bool,
    ) -> Result<BlobKey, MaterializeError> {
        let key = BlobKey::new(digest, executable);
        let mut handle = self
            .get_write(digest.clone(), WriteId::new(), executable)
            .await?;

        if !handle.needs_bytes() {
            handle.close_retaining().await?;
            return Ok(key);
        }

        let Some(delegate) = self.0.delegate.clone() else {
            handle.cancel().await;
            return Err(MaterializeError::NotFound(digest.clone()));
        };

        let reader = delegate
            .open_read(digest, 0)
            .await
            .map_err(MaterializeError::Io)?;
        let Some(mut reader) = reader else {
            handle.cancel().await;
            return Err(MaterializeError::NotFound(digest.clone()));
        };

        if let Err(e) = tokio::io::copy(&mut reader, &mut handle).await {
            handle.cancel().await;
            return Err(MaterializeError::Io(e));
        }
        handle.close_retaining().await?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::delegate::test_support::MemoryDelegate;
    use crate::digest::{DigestUtil, Sha256DigestUtil};
    use crate::key::BlobKey;
    use crate::tree::{Directory, FileNode, MapDirectorySource, SymlinkNode};
    use std::sync::Arc;

    async fn cache_in(dir: &Path) -> Cache {
        let config = CacheConfig::new(dir.to_path_buf(), 10_000, 1_000, Arc::new(Sha256DigestUtil));
        Cache::new(config).unwrap()
    }

    fn digest(bytes: &[u8]) -> Digest {
        Sha256DigestUtil.compute(bytes)
    }

    #[tokio::test]
    async fn materializes_two_files_and_indexes_them() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path()).await;
        cache.put(bytes::Bytes::from_static(b"xxxxxxxxxx")).await;
        cache.put(bytes::Bytes::from_static(b"yyyyyyyyyyyyyyyyyyyy")).await;

        let digest_x = digest(b"xxxxxxxxxx");
        let digest_y = digest(b"yyyyyyyyyyyyyyyyyyyy");

        let mut root_dir = Directory::new();
        root_dir.insert(
            "x",
            Node::File(FileNode {
                digest: digest_x.clone(),
                executable: false,
            }),
        );
        root_dir.insert(
            "y",
            Node::File(FileNode {
                digest: digest_y.clone(),
                executable: false,
            }),
        );
        let root_digest = Digest::build("d".repeat(64), 2).unwrap();
        let mut source = MapDirectorySource::new();
        source.insert(root_digest.clone(), root_dir);

        let path = cache.put_directory(root_digest.clone(), &source).await.unwrap();
        assert!(path.join("x").exists());
        assert!(path.join("y").exists());

        let key_x = BlobKey::new(&digest_x, false);
        let key_y = BlobKey::new(&digest_y, false);
        let entries = cache
            .0
            .directories_index
            .directory_entries(&root_digest)
            .await
            .unwrap();
        assert_eq!(entries, vec![key_x, key_y]);
        assert_eq!(cache.directory_storage_count(), 1);
    }

    #[tokio::test]
    async fn missing_source_entry_rolls_back_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path()).await;

        let source = MapDirectorySource::new();
        let root_digest = Digest::build("e".repeat(64), 2).unwrap();

        let err = cache
            .put_directory(root_digest.clone(), &source)
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializeError::PutDirectory { .. }));
        assert_eq!(cache.directory_storage_count(), 0);
        assert!(!cache.path_for_directory(&DirectoryKey::new(&root_digest)).exists());
    }

    #[tokio::test]
    async fn fetches_missing_file_from_delegate() {
        let dir = tempfile::tempdir().unwrap();
        let delegate = Arc::new(MemoryDelegate::new());
        let digest_x = digest(b"delegated");
        delegate.insert(digest_x.clone(), b"delegated".to_vec());

        let mut config = CacheConfig::new(dir.path(), 10_000, 1_000, Arc::new(Sha256DigestUtil));
        config.delegate = Some(delegate);
        let cache = Cache::new(config).unwrap();

        let mut root_dir = Directory::new();
        root_dir.insert(
            "x",
            Node::File(FileNode {
                digest: digest_x.clone(),
                executable: false,
            }),
        );
        let root_digest = Digest::build("f".repeat(64), 1).unwrap();
        let mut source = MapDirectorySource::new();
        source.insert(root_digest.clone(), root_dir);

        let path = cache.put_directory(root_digest, &source).await.unwrap();
        assert_eq!(std::fs::read(path.join("x")).unwrap(), b"delegated");
    }

    #[tokio::test]
    async fn materializes_symlinks_and_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path()).await;
        cache.put(bytes::Bytes::from_static(b"nested")).await;
        let digest_n = digest(b"nested");

        let mut inner = Directory::new();
        inner.insert(
            "n",
            Node::File(FileNode {
                digest: digest_n.clone(),
                executable: false,
            }),
        );
        let inner_digest = Digest::build("1".repeat(64), 1).unwrap();

        let mut root_dir = Directory::new();
        root_dir.insert("link", Node::Symlink(SymlinkNode { target: "n".into() }));
        root_dir.insert(
            "sub",
            Node::Directory(crate::tree::DirectoryNode {
                digest: inner_digest.clone(),
            }),
        );
        let root_digest = Digest::build("2".repeat(64), 1).unwrap();

        let mut source = MapDirectorySource::new();
        source.insert(root_digest.clone(), root_dir);
        source.insert(inner_digest, inner);

        let path = cache.put_directory(root_digest, &source).await.unwrap();
        assert!(path.join("sub").join("n").exists());
        let link_target = std::fs::read_link(path.join("link")).unwrap();
        assert_eq!(link_target, Path::new("n"));
    }
}
