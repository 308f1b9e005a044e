//! Bounded in-memory cache of object blocks.
//!
//! Two-level addressing: object id first, block index second. All objects
//! share one global LRU and one byte budget, so a hot object can push a
//! cold object's blocks out of memory. Evicted blocks are not lost — they
//! remain in the object's data file and are faulted back in on demand.
//!
//! `fetch` provides single-flight reconstruction: under concurrent demand
//! for the same absent block the fill closure runs exactly once and its
//! result (or error) is shared with every waiter. Errors are never cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use super::{CacheError, CacheResult};

/// Entries dropped per pruning pass once the byte budget is exceeded.
const DEFAULT_PRUNE_BATCH: usize = 100;

#[derive(Clone, PartialEq, Eq, Hash)]
struct BlockKey {
    object: Arc<str>,
    index: u64,
}

struct CachedBlock {
    data: Bytes,
    expires_at: Instant,
}

struct StoreInner {
    lru: LruCache<BlockKey, CachedBlock>,
    bytes_in_use: u64,
}

struct Shared {
    inner: Mutex<StoreInner>,
    in_flight: Mutex<HashMap<BlockKey, Vec<oneshot::Sender<CacheResult<Bytes>>>>>,
    max_bytes: u64,
    prune_batch: usize,
}

/// Process-wide block cache. Cheap to clone; all clones share storage.
#[derive(Clone)]
pub struct BlockStore {
    shared: Arc<Shared>,
}

impl BlockStore {
    pub fn new(max_bytes: u64) -> Self {
        Self::with_prune_batch(max_bytes, DEFAULT_PRUNE_BATCH)
    }

    pub fn with_prune_batch(max_bytes: u64, prune_batch: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(StoreInner {
                    lru: LruCache::unbounded(),
                    bytes_in_use: 0,
                }),
                in_flight: Mutex::new(HashMap::new()),
                max_bytes,
                prune_batch: prune_batch.max(1),
            }),
        }
    }

    /// Per-object view that subsequent block operations address.
    pub fn partition(&self, object: &str) -> BlockMap {
        BlockMap {
            store: self.clone(),
            object: Arc::from(object),
        }
    }

    /// Drop every cached block belonging to `object`.
    pub fn delete_all(&self, object: &str) {
        let mut inner = self.shared.inner.lock();
        let doomed: Vec<BlockKey> = inner
            .lru
            .iter()
            .filter(|(key, _)| &*key.object == object)
            .map(|(key, _)| key.clone())
            .collect();
        let count = doomed.len();
        for key in doomed {
            if let Some(block) = inner.lru.pop(&key) {
                inner.bytes_in_use -= block.data.len() as u64;
            }
        }
        trace!(object, count, "dropped cached blocks");
    }

    /// Total bytes currently held by cached blocks.
    pub fn bytes_in_use(&self) -> u64 {
        self.shared.inner.lock().bytes_in_use
    }

    fn get(&self, key: &BlockKey) -> Option<Bytes> {
        let mut inner = self.shared.inner.lock();
        let expired = match inner.lru.get(key) {
            Some(block) if block.expires_at > Instant::now() => return Some(block.data.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            if let Some(block) = inner.lru.pop(key) {
                inner.bytes_in_use -= block.data.len() as u64;
            }
        }
        None
    }

    fn set(&self, key: BlockKey, data: Bytes, ttl: Duration) {
        let mut inner = self.shared.inner.lock();
        let len = data.len() as u64;
        let replaced = inner.lru.push(
            key,
            CachedBlock {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
        if let Some((_, old)) = replaced {
            inner.bytes_in_use -= old.data.len() as u64;
        }
        inner.bytes_in_use += len;
        self.enforce_budget(&mut inner);
    }

    /// Evict least-recently-used blocks, in batches of at most
    /// `prune_batch`, until the store fits its byte budget again.
    fn enforce_budget(&self, inner: &mut StoreInner) {
        while inner.bytes_in_use > self.shared.max_bytes {
            let mut pruned = 0usize;
            while pruned < self.shared.prune_batch && inner.bytes_in_use > self.shared.max_bytes {
                match inner.lru.pop_lru() {
                    Some((_, block)) => {
                        inner.bytes_in_use -= block.data.len() as u64;
                        pruned += 1;
                    }
                    None => return,
                }
            }
            trace!(
                pruned,
                bytes_in_use = inner.bytes_in_use,
                "pruned block cache batch"
            );
        }
    }

    async fn fetch<F, Fut>(&self, key: BlockKey, ttl: Duration, fill: F) -> CacheResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<Bytes>>,
    {
        let mut fill = Some(fill);
        loop {
            if let Some(hit) = self.get(&key) {
                return Ok(hit);
            }

            let waiter = {
                let mut in_flight = self.shared.in_flight.lock();
                // A completed fill inserts into the cache before clearing its
                // in-flight slot, so a re-check here closes the race between
                // the miss above and this registration.
                if let Some(hit) = self.get(&key) {
                    return Ok(hit);
                }
                match in_flight.get_mut(&key) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        in_flight.insert(key.clone(), Vec::new());
                        None
                    }
                }
            };

            if let Some(rx) = waiter {
                match rx.await {
                    Ok(result) => return result,
                    // Filler task went away without completing; take over.
                    Err(_) => continue,
                }
            }

            let fill = match fill.take() {
                Some(fill) => fill,
                None => return Err(CacheError::Upstream("block fill restarted".into())),
            };
            let guard = InFlightGuard {
                shared: Arc::clone(&self.shared),
                key: Some(key.clone()),
            };
            let result = fill().await;
            if let Ok(data) = &result {
                self.set(key.clone(), data.clone(), ttl);
            }
            for tx in guard.complete() {
                let _ = tx.send(result.clone());
            }
            return result;
        }
    }
}

/// Clears the in-flight slot even if the filling task is cancelled, so
/// waiters wake up and re-drive the fetch instead of hanging.
struct InFlightGuard {
    shared: Arc<Shared>,
    key: Option<BlockKey>,
}

impl InFlightGuard {
    fn complete(mut self) -> Vec<oneshot::Sender<CacheResult<Bytes>>> {
        match self.key.take() {
            Some(key) => self
                .shared
                .in_flight
                .lock()
                .remove(&key)
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.shared.in_flight.lock().remove(&key);
        }
    }
}

/// Handle for one object's partition of the block store.
#[derive(Clone)]
pub struct BlockMap {
    store: BlockStore,
    object: Arc<str>,
}

impl BlockMap {
    pub fn object(&self) -> &str {
        &self.object
    }

    fn key(&self, index: u64) -> BlockKey {
        BlockKey {
            object: Arc::clone(&self.object),
            index,
        }
    }

    /// Pure lookup; refreshes LRU recency on a hit.
    pub fn get(&self, index: u64) -> Option<Bytes> {
        self.store.get(&self.key(index))
    }

    /// Insert a block, evicting LRU entries across the whole store if the
    /// byte budget is exceeded.
    pub fn set(&self, index: u64, data: Bytes, ttl: Duration) {
        self.store.set(self.key(index), data, ttl);
    }

    /// Return the cached block or run `fill` exactly once under concurrent
    /// demand, sharing the result (or error) with every waiter.
    pub async fn fetch<F, Fut>(&self, index: u64, ttl: Duration, fill: F) -> CacheResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<Bytes>>,
    {
        self.store.fetch(self.key(index), ttl, fill).await
    }
}
