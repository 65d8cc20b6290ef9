//! A content-addressable file cache for a Bazel remote-execution worker: a
//! local, digest-keyed blob store with hard-link-based materialization of
//! whole directory trees, LRU eviction under a byte budget, and an optional
//! delegate for read-through/write-through to a further cache tier.
//!
//! Shaped the way `tvix-castore` shapes its own storage layer: one narrow
//! digest/key layer (`digest`, `key`), a handful of small trait seams a
//! caller plugs concrete backends into (`delegate::Delegate`,
//! `tree::DirectorySource`, `directories_index::DirectoriesIndex`), and the
//! actual behavior spread across sibling modules that each add an `impl
//! Cache` block rather than one monolithic service type.

mod entry;
mod errors;
mod eviction;
mod fsutil;
mod lockmap;

pub mod cache;
pub mod delegate;
pub mod digest;
pub mod directories_index;
pub mod key;
pub mod materialize;
pub mod read;
pub mod startup;
pub mod tree;
pub mod write;

pub use cache::{Cache, CacheConfig, CacheStats, DirectoriesIndexBackend};
pub use digest::{Digest, DigestUtil, Sha256DigestUtil};
pub use directories_index::DirectoriesIndex;
pub use errors::{CacheError, DirectoriesIndexError, MaterializeError, WriteError};
pub use key::{BlobKey, DirectoryKey};
pub use startup::{CacheLoadResults, StartupCacheResults};
pub use tree::{Directory, DirectoryNode, DirectorySource, FileNode, MapDirectorySource, Node, SymlinkNode};
pub use write::{WriteHandle, WriteId};
