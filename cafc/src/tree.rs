//! The directory tree shape consumed by [crate::materialize::put_directory].
//! This is distinct from [crate::directories_index::DirectoriesIndex]: that
//! secondary index records which blob-keys a *materialized* directory ended
//! up using, while [DirectorySource] is the externally-supplied definition
//! of what a directory *should* contain. Names carry the digest's own hash
//! algorithm rather than a fixed-width digest type.

use crate::digest::{Digest, DigestUtil};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A file entry within a [Directory].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub digest: Digest,
    pub executable: bool,
}

/// A subdirectory reference within a [Directory], named by the digest of the
/// child [Directory] (recursive Merkle structure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    pub digest: Digest,
}

/// A symlink entry within a [Directory].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkNode {
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(FileNode),
    Directory(DirectoryNode),
    Symlink(SymlinkNode),
}

/// A directory tree node: an ordered-by-name set of [Node] entries. Entries
/// are kept in a `BTreeMap` so iteration is always in sorted dirent order,
/// matching the order the startup rescan walks directories on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    entries: BTreeMap<String, Node>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, node: Node) {
        self.entries.insert(name.into(), node);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// External collaborator that resolves a directory digest to its
/// [Directory] definition. The cache never stores this tree itself; it is
/// handed one per `put_directory` call, typically backed by the in-flight
/// action's declared input tree.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    async fn get(&self, digest: &Digest) -> Option<Directory>;
}

/// A [DirectorySource] backed by a plain in-memory map, for tests and for
/// callers that already hold the full tree (e.g. deserialized from an
/// action's input proto).
#[derive(Debug, Clone, Default)]
pub struct MapDirectorySource {
    directories: std::collections::HashMap<Digest, Directory>,
}

impl MapDirectorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, digest: Digest, directory: Directory) {
        self.directories.insert(digest, directory);
    }
}

#[async_trait]
impl DirectorySource for MapDirectorySource {
    async fn get(&self, digest: &Digest) -> Option<Directory> {
        self.directories.get(digest).cloned()
    }
}

/// Deterministic serialization of a [Directory]'s entries, one line per
/// entry in `BTreeMap` (i.e. sorted-by-name) order. Used by the startup
/// rescan's Phase Compute to recompute a reconstructed directory's digest
/// from scratch and check it against the name the tree was filed under —
/// a plain textual canonical encoding rather than a protobuf toolchain for
/// one internal checksum.
pub fn canonical_bytes(dir: &Directory) -> Vec<u8> {
    let mut buf = Vec::new();
    for (name, node) in dir.iter() {
        match node {
            Node::File(f) => buf.extend_from_slice(
                format!(
                    "{name}\tfile\t{}\t{}\t{}\n",
                    f.digest.hash(),
                    f.digest.size(),
                    f.executable
                )
                .as_bytes(),
            ),
            Node::Directory(d) => buf.extend_from_slice(
                format!("{name}\tdir\t{}\t{}\n", d.digest.hash(), d.digest.size()).as_bytes(),
            ),
            Node::Symlink(s) => {
                buf.extend_from_slice(format!("{name}\tsymlink\t{}\n", s.target).as_bytes())
            }
        }
    }
    buf
}

/// Computes the digest a reconstructed [Directory] would have had, via
/// [canonical_bytes].
pub fn compute_directory_digest(dir: &Directory, digest_util: &dyn DigestUtil) -> Digest {
    digest_util.compute(&canonical_bytes(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(hash: &str, size: u64) -> Digest {
        Digest::build(hash, size).unwrap()
    }

    #[tokio::test]
    async fn map_source_roundtrip() {
        let mut dir = Directory::new();
        dir.insert(
            "x",
            Node::File(FileNode {
                digest: digest("aaaa", 10),
                executable: false,
            }),
        );
        dir.insert(
            "y",
            Node::File(FileNode {
                digest: digest("bbbb", 20),
                executable: false,
            }),
        );

        let names: Vec<&str> = dir.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["x", "y"]);

        let mut source = MapDirectorySource::new();
        let root_digest = digest("cccc", 2);
        source.insert(root_digest.clone(), dir.clone());

        assert_eq!(source.get(&root_digest).await, Some(dir));
        assert_eq!(source.get(&digest("dddd", 9)).await, None);
    }

    #[test]
    fn canonical_digest_is_order_independent_and_content_sensitive() {
        use crate::digest::Sha256DigestUtil;

        let mut a = Directory::new();
        a.insert(
            "y",
            Node::File(FileNode {
                digest: digest("bbbb", 20),
                executable: false,
            }),
        );
        a.insert(
            "x",
            Node::File(FileNode {
                digest: digest("aaaa", 10),
                executable: false,
            }),
        );

        let mut b = Directory::new();
        b.insert(
            "x",
            Node::File(FileNode {
                digest: digest("aaaa", 10),
                executable: false,
            }),
        );
        b.insert(
            "y",
            Node::File(FileNode {
                digest: digest("bbbb", 20),
                executable: false,
            }),
        );

        let util = Sha256DigestUtil;
        assert_eq!(
            compute_directory_digest(&a, &util),
            compute_directory_digest(&b, &util)
        );

        let mut c = a.clone();
        c.insert(
            "x",
            Node::File(FileNode {
                digest: digest("aaaa", 10),
                executable: true,
            }),
        );
        assert_ne!(
            compute_directory_digest(&a, &util),
            compute_directory_digest(&c, &util)
        );
    }
}
