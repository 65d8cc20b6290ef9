use super::DirectoriesIndex;
use crate::digest::Digest;
use crate::errors::DirectoriesIndexError;
use crate::key::BlobKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Reference implementation: a combinatorial in-memory multimap. Used as the
/// default, and as the behavioral baseline the other two backends are tested
/// against.
#[derive(Default)]
pub struct MemoryDirectoriesIndex {
    forward: RwLock<HashMap<Digest, Vec<BlobKey>>>,
    /// Inverse mapping. No ordering claim on this one: downstream code never
    /// iterates it for ordering.
    inverse: RwLock<HashMap<BlobKey, HashSet<Digest>>>,
}

impl MemoryDirectoriesIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DirectoriesIndex for MemoryDirectoriesIndex {
    async fn put(
        &self,
        directory_digest: Digest,
        blob_keys: Vec<BlobKey>,
    ) -> Result<(), DirectoriesIndexError> {
        let mut inverse = self.inverse.write();
        for key in &blob_keys {
            inverse
                .entry(key.clone())
                .or_default()
                .insert(directory_digest.clone());
        }
        self.forward.write().insert(directory_digest, blob_keys);
        Ok(())
    }

    async fn directory_entries(
        &self,
        directory_digest: &Digest,
    ) -> Result<Vec<BlobKey>, DirectoriesIndexError> {
        Ok(self
            .forward
            .read()
            .get(directory_digest)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove(&self, directory_digest: &Digest) -> Result<(), DirectoriesIndexError> {
        let removed = self.forward.write().remove(directory_digest);
        if let Some(blob_keys) = removed {
            let mut inverse = self.inverse.write();
            for key in blob_keys {
                if let Some(set) = inverse.get_mut(&key) {
                    set.remove(directory_digest);
                    if set.is_empty() {
                        inverse.remove(&key);
                    }
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

    async fn start(&self) -> Result<(), DirectoriesIndexError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), DirectoriesIndexError> {
        Ok(())
    }
}
