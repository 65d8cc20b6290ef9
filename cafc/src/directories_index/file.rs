use super::DirectoriesIndex;
use crate::digest::Digest;
use crate::errors::DirectoriesIndexError;
use crate::key::BlobKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Forward map is one file per directory, at
/// `{root}/{hash}_{size}_dir_entries`, one blob-key per line; the inverse
/// map is kept in memory and rebuilt from those files on [start].
pub struct FileDirectoriesIndex {
    root: PathBuf,
    inverse: RwLock<HashMap<BlobKey, HashSet<Digest>>>,
}

fn entries_file_name(digest: &Digest) -> String {
    format!("{}_{}_dir_entries", digest.hash(), digest.size())
}

fn parse_entries_file_name(name: &str) -> Option<Digest> {
    let rest = name.strip_suffix("_dir_entries")?;
    let (hash, size) = rest.rsplit_once('_')?;
    let size: u64 = size.parse().ok()?;
    Digest::build(hash, size).ok()
}

impl FileDirectoriesIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inverse: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, digest: &Digest) -> PathBuf {
        self.root.join(entries_file_name(digest))
    }

    fn index_blob_keys(&self, directory_digest: &Digest, blob_keys: &[BlobKey]) {
        let mut inverse = self.inverse.write();
        for key in blob_keys {
            inverse
                .entry(key.clone())
                .or_default()
                .insert(directory_digest.clone());
        }
    }
}

#[async_trait]
impl DirectoriesIndex for FileDirectoriesIndex {
    async fn put(
        &self,
        directory_digest: Digest,
        blob_keys: Vec<BlobKey>,
    ) -> Result<(), DirectoriesIndexError> {
        let path = self.path_for(&directory_digest);
        let contents = blob_keys
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        tokio::fs::write(&path, contents).await?;
        self.index_blob_keys(&directory_digest, &blob_keys);
        Ok(())
    }

    async fn directory_entries(
        &self,
        directory_digest: &Digest,
    ) -> Result<Vec<BlobKey>, DirectoriesIndexError> {
        let path = self.path_for(directory_digest);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(parse_entries(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, directory_digest: &Digest) -> Result<(), DirectoriesIndexError> {
        let blob_keys = self.directory_entries(directory_digest).await?;
        let path = self.path_for(directory_digest);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut inverse = self.inverse.write();
        for key in blob_keys {
            if let Some(set) = inverse.get_mut(&key) {
                set.remove(directory_digest);
                if set.is_empty() {
                    inverse.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn remove_entry(&self, blob_key: &BlobKey) -> Result<Vec<Digest>, DirectoriesIndexError> {
        let digests: Vec<Digest> = self
            .inverse
            .write()
            .remove(blob_key)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        Ok(digests)
    }

    /// Rebuilds the in-memory inverse map from every `*_dir_entries` file
    /// found at `root`. The forward map stays on disk; we only cache the
    /// inverse map since `remove_entry` needs it to be fast.
    async fn start(&self) -> Result<(), DirectoriesIndexError> {
        let root = self.root.clone();
        let entries = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<_>> {
            let mut found = Vec::new();
            if !root.exists() {
                return Ok(found);
            }
            for entry in std::fs::read_dir(&root)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                let Some(digest) = parse_entries_file_name(name) else {
                    continue;
                };
                let contents = std::fs::read_to_string(entry.path())?;
                found.push((digest, parse_entries(&contents)));
            }
            Ok(found)
        })
        .await
        .map_err(|e| DirectoriesIndexError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        for (digest, blob_keys) in entries {
            self.index_blob_keys(&digest, &blob_keys);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DirectoriesIndexError> {
        Ok(())
    }

    fn owns_path(&self, file_name: &str) -> bool {
        parse_entries_file_name(file_name).is_some()
    }
}

fn parse_entries(contents: &str) -> Vec<BlobKey> {
    contents
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(BlobKey::parse)
        .collect()
}
