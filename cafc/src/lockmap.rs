//! Per-directory-key mutual exclusion: materializing the same directory
//! digest concurrently must serialize, while different digests materialize
//! in parallel. Modeled as a map of `key -> mutex`,
//! reclaimed lazily once the last holder drops its guard, rather than a
//! single global lock (which would serialize unrelated directories) or a
//! map that grows without bound (which would leak one entry per digest ever
//! materialized).

use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<Mutex<()>>,
    refs: usize,
}

/// A map of `K -> tokio::sync::Mutex<()>`, handed out as RAII guards. Slots
/// are created on first acquisition and removed once the last outstanding
/// guard for that key is dropped.
pub struct LockMap<K> {
    slots: SyncMutex<HashMap<K, Slot>>,
}

impl<K> Default for LockMap<K> {
    fn default() -> Self {
        Self {
            slots: SyncMutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> LockMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting for any concurrent holder.
    /// Cancel-safe: dropping the returned future before it resolves releases
    /// any bookkeeping this call made, so an interrupted acquisition doesn't
    /// leak a slot.
    pub async fn lock(&self, key: K) -> LockGuard<K> {
        let mutex = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                mutex: Arc::new(Mutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            slot.mutex.clone()
        };

        let guard = mutex.lock_owned().await;
        LockGuard {
            key,
            guard: Some(guard),
            map: self,
        }
    }
}

/// RAII guard for a held [LockMap] key. Dropping it releases the mutex and,
/// if no other caller is waiting on the same key, removes the slot.
pub struct LockGuard<'a, K: Eq + Hash + Clone> {
    key: K,
    // Only `None` during drop, after the inner guard has been released.
    guard: Option<OwnedMutexGuard<()>>,
    map: &'a LockMap<K>,
}

impl<'a, K: Eq + Hash + Clone> Drop for LockGuard<'a, K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.map.slots.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let map = Arc::new(LockMap::<String>::new());
        let counter = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = map.lock("a".to_string()).await;
                let cur = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(cur, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_run_in_parallel() {
        let map = Arc::new(LockMap::<String>::new());
        let max_concurrent = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let map = map.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = map.lock(format!("key-{i}")).await;
                let cur = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(cur, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_concurrent.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn slot_reclaimed_after_release() {
        let map = LockMap::<String>::new();
        {
            let _guard = map.lock("a".to_string()).await;
            assert_eq!(map.slots.lock().len(), 1);
        }
        assert_eq!(map.slots.lock().len(), 0);
    }
}
