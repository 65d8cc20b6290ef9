//! The optional secondary cache consulted on local miss (read-through) and
//! written to on eviction (write-through). A `has`/`open_read`/`open_write`
//! seam; `open_read` accepts the byte offset `new_input` needs directly,
//! instead of requiring a separate seek.

use crate::digest::Digest;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A secondary content-addressable store used for read-through on local
/// miss and write-through on eviction. Implementations are expected to be
/// cheaply `Clone`-able handles (e.g. an `Arc`-wrapped gRPC client).
#[async_trait]
pub trait Delegate: Send + Sync {
    /// True if the delegate has `digest`, recursively if it itself delegates
    /// further.
    async fn has(&self, digest: &Digest) -> std::io::Result<bool>;

    /// Opens a read over `digest`'s bytes starting at `offset`. `None` if the
    /// delegate doesn't have it either.
    async fn open_read(
        &self,
        digest: &Digest,
        offset: u64,
    ) -> std::io::Result<Option<Box<dyn AsyncRead + Send + Unpin>>>;

    /// Opens a write-through sink for `digest`, used by eviction to push an
    /// about-to-be-evicted blob's bytes to the delegate before discarding
    /// the local copy. Best-effort: the eviction path logs and proceeds on
    /// I/O error rather than blocking indefinitely.
    async fn open_write(&self, digest: &Digest) -> std::io::Result<Box<dyn AsyncWrite + Send + Unpin>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    /// An in-memory [Delegate] for tests: a plain digest-keyed byte map.
    #[derive(Default, Clone)]
    pub struct MemoryDelegate {
        blobs: Arc<Mutex<HashMap<Digest, Vec<u8>>>>,
    }

    impl MemoryDelegate {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, digest: Digest, bytes: Vec<u8>) {
            self.blobs.lock().insert(digest, bytes);
        }

        pub fn get(&self, digest: &Digest) -> Option<Vec<u8>> {
            self.blobs.lock().get(digest).cloned()
        }
    }

    struct WriteThrough {
        blobs: Arc<Mutex<HashMap<Digest, Vec<u8>>>>,
        digest: Digest,
        buf: Vec<u8>,
    }

    impl tokio::io::AsyncWrite for WriteThrough {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.buf.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            self.blobs
                .lock()
                .insert(self.digest.clone(), std::mem::take(&mut self.buf));
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl Delegate for MemoryDelegate {
        async fn has(&self, digest: &Digest) -> std::io::Result<bool> {
            Ok(self.blobs.lock().contains_key(digest))
        }

        async fn open_read(
            &self,
            digest: &Digest,
            offset: u64,
        ) -> std::io::Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
            let Some(bytes) = self.blobs.lock().get(digest).cloned() else {
                return Ok(None);
            };
            let start = (offset as usize).min(bytes.len());
            Ok(Some(Box::new(Cursor::new(bytes[start..].to_vec()))))
        }

        async fn open_write(
            &self,
            digest: &Digest,
        ) -> std::io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
            Ok(Box::new(WriteThrough {
                blobs: self.blobs.clone(),
                digest: digest.clone(),
                buf: Vec::new(),
            }))
        }
    }

    #[tokio::test]
    async fn memory_delegate_roundtrip() {
        let delegate = MemoryDelegate::new();
        let digest = Digest::build("aaaa", 3).unwrap();
        delegate.insert(digest.clone(), b"abc".to_vec());

        assert!(delegate.has(&digest).await.unwrap());
        let mut reader = delegate.open_read(&digest, 1).await.unwrap().unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bc");
    }
}
