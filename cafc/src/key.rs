//! Deterministic mapping between a [Digest] and the names used for it on
//! disk and in the storage map: blob-keys (`{hash}_{size}[_exec]`) and
//! directory-keys (`{hash}_{size}_dir`).

use crate::digest::Digest;
use std::fmt;

/// Textual key for a cached blob: `{hash}_{size}` or `{hash}_{size}_exec`.
/// The same digest may exist under both variants concurrently; they are
/// distinct cache entries.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey {
    hash: String,
    size: u64,
    executable: bool,
}

impl BlobKey {
    pub fn new(digest: &Digest, executable: bool) -> Self {
        Self {
            hash: digest.hash().to_string(),
            size: digest.size(),
            executable,
        }
    }

    pub fn executable(&self) -> bool {
        self.executable
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Parses a blob-key from a filename. Returns `None` if the name isn't
    /// of the form `{hash}_{size}` or `{hash}_{size}_exec`.
    pub fn parse(name: &str) -> Option<Self> {
        let (rest, executable) = match name.strip_suffix("_exec") {
            Some(rest) => (rest, true),
            None => (name, false),
        };
        let (hash, size) = rest.rsplit_once('_')?;
        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let size: u64 = size.parse().ok()?;
        Some(Self {
            hash: hash.to_string(),
            size,
            executable,
        })
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.executable {
            write!(f, "{}_{}_exec", self.hash, self.size)
        } else {
            write!(f, "{}_{}", self.hash, self.size)
        }
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Textual key for a materialized directory tree: `{hash}_{size}_dir`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryKey {
    hash: String,
    size: u64,
}

impl DirectoryKey {
    pub fn new(digest: &Digest) -> Self {
        Self {
            hash: digest.hash().to_string(),
            size: digest.size(),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_suffix("_dir")?;
        let (hash, size) = rest.rsplit_once('_')?;
        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let size: u64 = size.parse().ok()?;
        Some(Self {
            hash: hash.to_string(),
            size,
        })
    }
}

impl fmt::Display for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_dir", self.hash, self.size)
    }
}

impl fmt::Debug for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(hash: &str, size: u64) -> Digest {
        Digest::build(hash, size).unwrap()
    }

    #[test]
    fn blob_key_roundtrip() {
        let d = digest("aaaa", 60);
        let k = BlobKey::new(&d, false);
        assert_eq!(k.to_string(), "aaaa_60");
        assert_eq!(BlobKey::parse(&k.to_string()).unwrap(), k);

        let k_exec = BlobKey::new(&d, true);
        assert_eq!(k_exec.to_string(), "aaaa_60_exec");
        assert_eq!(BlobKey::parse(&k_exec.to_string()).unwrap(), k_exec);

        assert_ne!(k, k_exec);
    }

    #[test]
    fn directory_key_roundtrip() {
        let d = digest("bbbb", 10);
        let k = DirectoryKey::new(&d);
        assert_eq!(k.to_string(), "bbbb_10_dir");
        assert_eq!(DirectoryKey::parse(&k.to_string()).unwrap(), k);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(BlobKey::parse("not-a-key").is_none());
        assert!(BlobKey::parse("zz_10").is_none());
        assert!(DirectoryKey::parse("aaaa_10").is_none());
    }
}
