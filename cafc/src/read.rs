//! Read path: local lookup across executable variants, with self-healing
//! removal of stale entries, falling through to a delegate-backed
//! read-through stream on total local miss. Serve local first, and on miss
//! tee a remote read into local storage rather than discarding it.

use crate::cache::Cache;
use crate::digest::Digest;
use crate::errors::CacheError;
use crate::key::BlobKey;
use crate::write::{WriteHandle, WriteId};
use bytes::Bytes;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;

impl Cache {
    /// Opens a reader over `digest` starting at `offset`. Zero-size digests
    /// never touch storage: an empty reader is handed back directly.
    #[tracing::instrument(skip(self), fields(digest = %digest, offset = offset))]
    pub async fn new_input(
        &self,
        digest: &Digest,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, CacheError> {
        if digest.is_empty() {
            return Ok(Box::new(std::io::Cursor::new(Vec::new())));
        }

        if let Some(reader) = self.open_local(digest, offset).await? {
            return Ok(reader);
        }

        let Some(delegate) = self.0.delegate.clone() else {
            return Err(CacheError::NotFound(digest.clone()));
        };

        let Some(remote) = delegate.open_read(digest, offset).await? else {
            return Err(CacheError::NotFound(digest.clone()));
        };

        // Only a from-the-start read can be faithfully mirrored into a
        // brand-new local entry — a non-zero `offset` already skips bytes
        // a local write would need from position 0 (see DESIGN.md). Those
        // reads, and anything too large to cache, are proxied straight
        // through without touching local storage.
        if offset != 0 || digest.size() > self.0.max_entry_size_bytes {
            return Ok(remote);
        }

        let handle = match self.get_write(digest.clone(), WriteId::new(), false).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(digest = %digest, error = %e, "new_input: get_write for read-through mirror failed");
                return Ok(remote);
            }
        };

        if !handle.needs_bytes() {
            // Raced with a concurrent writer (or the zero-size/duplicate
            // cases, already handled above): nothing to mirror, so drop our
            // extra reference and just hand back the delegate's bytes.
            handle.cancel().await;
            return Ok(remote);
        }

        Ok(Box::new(tee(remote, handle)))
    }

    /// Tries each executable variant in turn. A file missing out from under
    /// the storage map (external removal, crash) triggers self-healing
    /// removal of the stale entry, then falls through to the other variant.
    async fn open_local(
        &self,
        digest: &Digest,
        offset: u64,
    ) -> Result<Option<Box<dyn AsyncRead + Send + Unpin>>, CacheError> {
        for executable in [false, true] {
            let key = BlobKey::new(digest, executable);
            let idx = {
                let state = self.0.state.lock();
                state.storage.get(&key).copied()
            };
            let Some(idx) = idx else {
                continue;
            };

            let path = self.path_for_key(&key);
            match tokio::fs::File::open(&path).await {
                Ok(mut file) => {
                    if offset > 0 {
                        file.seek(std::io::SeekFrom::Start(offset)).await?;
                    }
                    self.record_access(idx);
                    return Ok(Some(Box::new(file)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.remove_stale_entry(&key, idx);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Removes `idx` from the storage map and LRU list, but only if it's
    /// still the entry currently filed under `key` — a concurrent eviction
    /// or reinsertion may already have replaced it.
    fn remove_stale_entry(&self, key: &BlobKey, idx: usize) {
        let mut state = self.0.state.lock();
        if state.storage.get(key) != Some(&idx) {
            return;
        }
        state.storage.remove(key);
        let removed = state.lru.remove(idx);
        state.size_in_bytes = state.size_in_bytes.saturating_sub(removed.size);
        tracing::warn!(key = %key, "cache file missing on disk; removed stale entry");
    }
}

/// Bridges a delegate's bytes to the caller while mirroring them into a new
/// local [WriteHandle]. The handle is driven to completion in a background
/// task regardless of whether the caller reads the whole stream: a caller
/// that stops early still leaves a correctly hashed, complete local copy
/// behind, the same way eviction's write-through doesn't wait on a reader.
fn tee(mut remote: Box<dyn AsyncRead + Send + Unpin>, mut handle: WriteHandle) -> TeeReader {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match remote.read(&mut buf).await {
                Ok(0) => {
                    if let Err(e) = handle.close().await {
                        let _ = tx
                            .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
                            .await;
                    }
                    break;
                }
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if let Err(e) = handle.write_all(&chunk).await {
                        handle.cancel().await;
                        let _ = tx
                            .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
                            .await;
                        break;
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Caller dropped the reader; still finish the local
                        // write so a subsequent get() is served locally.
                        continue;
                    }
                }
                Err(e) => {
                    handle.cancel().await;
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    TeeReader {
        rx,
        buf: Bytes::new(),
    }
}

/// The caller-facing half of [tee]: drains the channel, handing back
/// buffered bytes before polling for the next chunk.
struct TeeReader {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
    buf: Bytes,
}

impl AsyncRead for TeeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.buf.is_empty() {
                let n = this.buf.len().min(dst.remaining());
                dst.put_slice(&this.buf[..n]);
                this.buf = this.buf.split_off(n);
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buf = bytes;
                    continue;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::delegate::test_support::MemoryDelegate;
    use crate::digest::{DigestUtil, Sha256DigestUtil};
    use std::sync::Arc;
    use std::time::Duration;

    async fn cache_in(dir: &std::path::Path) -> Cache {
        let config = CacheConfig::new(dir.to_path_buf(), 10_000, 1_000, Arc::new(Sha256DigestUtil));
        Cache::new(config).unwrap()
    }

    async fn read_all(mut reader: Box<dyn AsyncRead + Send + Unpin>) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn local_hit_returns_cached_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path()).await;
        cache.put(bytes::Bytes::from_static(b"hello")).await;
        let digest = Sha256DigestUtil.compute(b"hello");

        let reader = cache.new_input(&digest, 0).await.unwrap();
        assert_eq!(read_all(reader).await, b"hello");
    }

    #[tokio::test]
    async fn missing_everywhere_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path()).await;
        let digest = Digest::build("a".repeat(64), 5).unwrap();
        let err = cache.new_input(&digest, 0).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
    }

    #[tokio::test]
    async fn stale_entry_is_healed_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path()).await;
        cache.put(bytes::Bytes::from_static(b"hello")).await;
        let digest = Sha256DigestUtil.compute(b"hello");
        let key = BlobKey::new(&digest, false);

        tokio::fs::remove_file(cache.path_for_key(&key)).await.unwrap();
        assert_eq!(cache.entry_count(), 1);

        let err = cache.new_input(&digest, 0).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
        assert_eq!(cache.entry_count(), 0, "stale entry should be healed away");
    }

    #[tokio::test]
    async fn read_through_miss_mirrors_into_local_cache() {
        let dir = tempfile::tempdir().unwrap();
        let delegate = Arc::new(MemoryDelegate::new());
        let digest = Sha256DigestUtil.compute(b"delegated bytes");
        delegate.insert(digest.clone(), b"delegated bytes".to_vec());

        let mut config = CacheConfig::new(dir.path(), 10_000, 1_000, Arc::new(Sha256DigestUtil));
        config.delegate = Some(delegate);
        let cache = Cache::new(config).unwrap();

        let reader = cache.new_input(&digest, 0).await.unwrap();
        assert_eq!(read_all(reader).await, b"delegated bytes");

        // The local mirror completes in the background; poll briefly.
        for _ in 0..50 {
            if cache.entry_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.entry_count(), 1);
        assert!(cache.contains(&digest).await);
    }

    #[tokio::test]
    async fn nonzero_offset_read_does_not_mirror_locally() {
        let dir = tempfile::tempdir().unwrap();
        let delegate = Arc::new(MemoryDelegate::new());
        let digest = Sha256DigestUtil.compute(b"0123456789");
        delegate.insert(digest.clone(), b"0123456789".to_vec());

        let mut config = CacheConfig::new(dir.path(), 10_000, 1_000, Arc::new(Sha256DigestUtil));
        config.delegate = Some(delegate);
        let cache = Cache::new(config).unwrap();

        let reader = cache.new_input(&digest, 5).await.unwrap();
        assert_eq!(read_all(reader).await, b"56789");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn oversized_blob_bypasses_local_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let delegate = Arc::new(MemoryDelegate::new());
        let digest = Sha256DigestUtil.compute(b"way too large for this cache");
        delegate.insert(digest.clone(), b"way too large for this cache".to_vec());

        let mut config = CacheConfig::new(dir.path(), 10_000, 10, Arc::new(Sha256DigestUtil));
        config.delegate = Some(delegate);
        let cache = Cache::new(config).unwrap();

        let reader = cache.new_input(&digest, 0).await.unwrap();
        assert_eq!(read_all(reader).await, b"way too large for this cache");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.entry_count(), 0);
    }
}
