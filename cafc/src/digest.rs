//! Digest value type and the pluggable hashing collaborator ([DigestUtil]).
//!
//! A [Digest] is a pure `(hash, size)` pair, hash encoded as lowercase hex.
//! Unlike a fixed-width digest type that hardcodes one hash function and
//! byte length, the remote-execution API this cache serves names its hash
//! function in the `Digest` message itself, so the length isn't fixed at the
//! type level. [DigestUtil] is the seam a caller plugs a concrete hash
//! function into; [Sha256DigestUtil] is the one shipped here.

use data_encoding::HEXLOWER;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid digest hash: {0}")]
    InvalidHash(String),
}

/// `(hash: lowercase-hex string, size: int64 >= 0)`. Equality is structural.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hash: String,
    size: u64,
}

impl Digest {
    /// Builds a digest from an already-known hash and size, validating that
    /// the hash looks like lowercase hex. Does not verify the hash actually
    /// corresponds to `size` bytes of anything; callers that need that
    /// guarantee should go through [DigestUtil::compute].
    pub fn build(hash: impl Into<String>, size: u64) -> Result<Self, Error> {
        let hash = hash.into();
        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidHash(hash));
        }
        Ok(Self {
            hash: hash.to_ascii_lowercase(),
            size,
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size 0 is the canonical empty blob; it never materializes a file.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size)
    }
}

/// A [std::io::Write]-like sink that hashes everything written to it, and
/// yields its digest on close. Implementations wrap a concrete hasher (e.g.
/// [sha2::Sha256]).
pub trait HashingWriter: tokio::io::AsyncWrite + Send + Unpin {
    /// Number of bytes written so far.
    fn written(&self) -> u64;

    /// Finalizes the hash over everything written. Does not consume bytes
    /// written after this is called (callers must stop writing first).
    fn finalize_hash(&self) -> String;

    /// Feeds `bytes` into the hash state without writing them to the inner
    /// sink. Used to resume hashing over a partial write's already-committed
    /// bytes: those bytes are already on disk, so replaying
    /// them through the ordinary write path would duplicate them.
    fn update_hash_only(&mut self, bytes: &[u8]);
}

/// The hashing collaborator: computes digests, mints digests for bytes
/// already known, and builds [HashingWriter]s for blobs in flight.
pub trait DigestUtil: Send + Sync {
    fn compute(&self, bytes: &[u8]) -> Digest;
    fn build(&self, hash: &str, size: u64) -> Result<Digest, Error>;
    /// Wraps `inner` in a [HashingWriter]. Takes a boxed, type-erased writer
    /// (rather than a generic one) so `DigestUtil` stays object-safe: the
    /// cache stores it as `Arc<dyn DigestUtil>`, same as the delegate and
    /// the directories index.
    fn new_hashing_writer(
        &self,
        inner: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    ) -> Box<dyn HashingWriter>;
    fn empty(&self) -> Digest;
}

/// SHA-256-backed [DigestUtil], matching the hash function Bazel's remote
/// execution API uses by default.
#[derive(Clone, Copy, Default)]
pub struct Sha256DigestUtil;

impl DigestUtil for Sha256DigestUtil {
    fn compute(&self, bytes: &[u8]) -> Digest {
        use sha2::Digest as _;
        let hash = sha2::Sha256::digest(bytes);
        Digest {
            hash: HEXLOWER.encode(&hash),
            size: bytes.len() as u64,
        }
    }

    fn build(&self, hash: &str, size: u64) -> Result<Digest, Error> {
        Digest::build(hash, size)
    }

    fn new_hashing_writer(
        &self,
        inner: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    ) -> Box<dyn HashingWriter> {
        Box::new(Sha256HashingWriter::new(inner))
    }

    fn empty(&self) -> Digest {
        self.compute(&[])
    }
}

use pin_project_lite::pin_project;

pin_project! {
    struct Sha256HashingWriter<W> {
        #[pin]
        inner: W,
        hasher: sha2::Sha256,
        written: u64,
    }
}

impl<W> Sha256HashingWriter<W> {
    fn new(inner: W) -> Self {
        use sha2::Digest as _;
        Self {
            inner,
            hasher: sha2::Sha256::new(),
            written: 0,
        }
    }
}

impl<W: tokio::io::AsyncWrite> tokio::io::AsyncWrite for Sha256HashingWriter<W> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        use sha2::Digest as _;
        let this = self.project();
        let res = this.inner.poll_write(cx, buf);
        if let std::task::Poll::Ready(Ok(n)) = &res {
            this.hasher.update(&buf[..*n]);
            *this.written += *n as u64;
        }
        res
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

impl<W: tokio::io::AsyncWrite + Send + Unpin> HashingWriter for Sha256HashingWriter<W> {
    fn written(&self) -> u64 {
        self.written
    }

    fn finalize_hash(&self) -> String {
        use sha2::Digest as _;
        HEXLOWER.encode(&self.hasher.clone().finalize())
    }

    fn update_hash_only(&mut self, bytes: &[u8]) {
        use sha2::Digest as _;
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rejects_non_hex() {
        assert!(Digest::build("not-hex!", 3).is_err());
    }

    #[test]
    fn build_lowercases() {
        let d = Digest::build("ABCDEF", 1).unwrap();
        assert_eq!(d.hash(), "abcdef");
    }

    #[test]
    fn compute_matches_known_vector() {
        let util = Sha256DigestUtil;
        let d = util.compute(b"abc");
        assert_eq!(
            d.hash(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(d.size(), 3);
    }

    #[test]
    fn empty_digest_has_zero_size() {
        let util = Sha256DigestUtil;
        assert!(util.empty().is_empty());
    }
}
