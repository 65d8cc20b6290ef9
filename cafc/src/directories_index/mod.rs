//! The secondary index relating cached blobs to the directory trees that
//! reference them: `blob-key -> set of directory-digests`, plus the inverse
//! `directory-digest -> ordered list of blob-keys`.
//!
//! Three interchangeable implementations are provided, one trait with
//! several storage-backed impls: [memory::MemoryDirectoriesIndex],
//! [file::FileDirectoriesIndex] and [sqlite::SqliteDirectoriesIndex]. They
//! MUST be behaviorally interchangeable.

use crate::digest::Digest;
use crate::errors::DirectoriesIndexError;
use crate::key::BlobKey;
use async_trait::async_trait;

mod file;
mod memory;
mod sqlite;

pub use file::FileDirectoriesIndex;
pub use memory::MemoryDirectoriesIndex;
pub use sqlite::SqliteDirectoriesIndex;

#[cfg(test)]
mod tests;

#[async_trait]
pub trait DirectoriesIndex: Send + Sync {
    /// Inserts the forward mapping and the inverse mapping for every listed
    /// blob-key. `blob_keys` order is preserved by [DirectoriesIndex::directory_entries].
    async fn put(
        &self,
        directory_digest: Digest,
        blob_keys: Vec<BlobKey>,
    ) -> Result<(), DirectoriesIndexError>;

    /// Returns the blob-keys for `directory_digest`, in insertion order.
    /// Empty if absent.
    async fn directory_entries(
        &self,
        directory_digest: &Digest,
    ) -> Result<Vec<BlobKey>, DirectoriesIndexError>;

    /// Removes the forward mapping and retracts inverse entries.
    async fn remove(&self, directory_digest: &Digest) -> Result<(), DirectoriesIndexError>;

    /// Returns every directory-digest that (transitively, via `put`)
    /// referenced `blob_key`, removing them from the inverse mapping. The
    /// caller is responsible for scheduling expiration of each returned
    /// directory.
    async fn remove_entry(&self, blob_key: &BlobKey) -> Result<Vec<Digest>, DirectoriesIndexError>;

    async fn start(&self) -> Result<(), DirectoriesIndexError>;
    async fn close(&self) -> Result<(), DirectoriesIndexError>;

    /// True if `file_name` (a bare name directly under the cache root) is
    /// this backend's own bookkeeping file rather than a blob or directory
    /// the startup rescan should classify. [memory::MemoryDirectoriesIndex]
    /// keeps no on-disk state, so it owns nothing.
    fn owns_path(&self, _file_name: &str) -> bool {
        false
    }
}
