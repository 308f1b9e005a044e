//! Process-wide registry of cached objects.
//!
//! The registry owns the map from object URI to cache entry and enforces
//! the single-flight discipline on misses: the coarse write lock is held
//! across the upstream fetch, so concurrent `get`s either attach to the
//! entry the winner inserted or observe its error. Each slot additionally
//! carries its own lock so TTL revalidation for one object never blocks
//! the rest of the map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::fs;
use tracing::{debug, error, info, warn};

use super::block_store::BlockStore;
use super::faulting::{FaultingFile, FaultingReader, data_path};
use super::{CacheError, CacheResult};
use crate::models::context::RequestContext;
use crate::models::meta::{META_SUFFIX, Meta};
use crate::sources::{SourceError, UpstreamSource};

/// One cached object: the faulting file shared with every outstanding
/// reader, plus its metadata. `meta` is only mutated to refresh `expires`
/// after a successful revalidation.
struct CacheEntry {
    file: Arc<FaultingFile>,
    meta: parking_lot::RwLock<Meta>,
}

/// A map slot. `entry` is `None` for tombstoned objects; the slot lock
/// serializes revalidation per object.
#[derive(Default)]
struct Slot {
    validate_lock: tokio::sync::Mutex<()>,
    entry: parking_lot::RwLock<Option<Arc<CacheEntry>>>,
}

pub struct ObjectRegistry {
    cache_dir: PathBuf,
    ttl: TimeDelta,
    upstream: Option<Arc<dyn UpstreamSource>>,
    block_store: BlockStore,
    slots: tokio::sync::RwLock<HashMap<String, Arc<Slot>>>,
}

impl ObjectRegistry {
    /// `upstream = None` builds a recovery-only registry: cached entries are
    /// served from disk and misses fail, which is what the startup scan and
    /// the persistence tests need.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        ttl_seconds: u64,
        block_store: BlockStore,
        upstream: Option<Arc<dyn UpstreamSource>>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ttl: TimeDelta::seconds(ttl_seconds as i64),
            upstream,
            block_store,
            slots: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Return a reader over the cached object, fetching from the upstream
    /// on a miss. At most one upstream fetch runs per URI; every other
    /// caller blocks until it resolves.
    pub async fn get(&self, ctx: &RequestContext, uri: &str) -> CacheResult<FaultingReader> {
        // Reject traversal-prone keys before any disk or upstream work; the
        // upstream maps the same key onto the cache directory.
        self.object_paths(uri)?;
        self.validate(ctx, uri).await;

        {
            let slots = self.slots.read().await;
            if let Some(entry) = slots.get(uri).and_then(|slot| slot.entry.read().clone()) {
                debug!(seq = ctx.seq, uri, "cache hit");
                return Ok(FaultingReader::new(Arc::clone(&entry.file), *ctx));
            }
        }

        let mut slots = self.slots.write().await;
        let slot = Arc::clone(slots.entry(uri.to_string()).or_default());
        // Double-checked: another task may have fetched while we waited for
        // the write lock.
        if let Some(entry) = slot.entry.read().clone() {
            debug!(seq = ctx.seq, uri, "cache hit after fetch wait");
            return Ok(FaultingReader::new(Arc::clone(&entry.file), *ctx));
        }

        let upstream = self.upstream.as_deref().ok_or(CacheError::NoUpstream)?;
        info!(seq = ctx.seq, uri, "cache miss, fetching upstream");
        let fetched = upstream.fetch(ctx, uri).await.map_err(|err| match err {
            SourceError::NotFound => CacheError::NotFound(uri.to_string()),
            other => CacheError::Upstream(other.to_string()),
        })?;

        let mut meta = fetched.meta;
        meta.expires = Utc::now() + self.ttl;
        if let Err(err) = self.write_meta(uri, &meta).await {
            // A missing sidecar only costs recoverability after a restart.
            error!(seq = ctx.seq, uri, error = %err, "failed to persist meta sidecar");
        }

        let entry = Arc::new(CacheEntry {
            file: Arc::clone(&fetched.file),
            meta: parking_lot::RwLock::new(meta),
        });
        *slot.entry.write() = Some(entry);

        Ok(FaultingReader::new(fetched.file, *ctx))
    }

    /// Copy of the object's metadata, if cached.
    pub async fn get_meta(&self, uri: &str) -> Option<Meta> {
        let slots = self.slots.read().await;
        let entry = slots.get(uri)?.entry.read().clone()?;
        let meta = entry.meta.read().clone();
        Some(meta)
    }

    /// Remove the object from the cache: data file, meta sidecar, cached
    /// blocks, and the registry entry. Outstanding readers keep the
    /// faulting file alive until they finish.
    pub async fn delete(&self, ctx: &RequestContext, uri: &str) -> CacheResult<()> {
        let slot = { self.slots.read().await.get(uri).cloned() };
        let Some(slot) = slot else {
            return Ok(());
        };
        // Nulling the entry is the atomic act; file removal trails it.
        let Some(_entry) = slot.entry.write().take() else {
            return Ok(());
        };
        info!(seq = ctx.seq, uri, "deleting cache entry");

        let (data_path, meta_path) = self.object_paths(uri)?;
        for path in [&data_path, &meta_path] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    error!(seq = ctx.seq, path = %path.display(), error = %err, "failed to remove cache file");
                }
            }
        }
        self.block_store.delete_all(uri);
        Ok(())
    }

    /// Directory listing pass-through; never cached.
    pub async fn directory(&self, ctx: &RequestContext, prefix: &str) -> CacheResult<Vec<String>> {
        let upstream = self.upstream.as_deref().ok_or(CacheError::NoUpstream)?;
        debug!(seq = ctx.seq, prefix, "listing directory");
        upstream.directory(prefix).await.map_err(|err| match err {
            SourceError::NotFound => CacheError::NotFound(prefix.to_string()),
            other => CacheError::Upstream(other.to_string()),
        })
    }

    /// Register an entry whose data file already exists on disk. Used by
    /// the startup scan and by tests that pre-seed the cache.
    pub async fn add_meta(&self, uri: &str, meta: Meta) -> CacheResult<()> {
        let (data_path, _) = self.object_paths(uri)?;
        let partition = self.block_store.partition(uri);
        let file = Arc::new(FaultingFile::new(None, data_path, meta.size, partition).await?);
        let entry = Arc::new(CacheEntry {
            file,
            meta: parking_lot::RwLock::new(meta),
        });

        let mut slots = self.slots.write().await;
        let slot = Arc::clone(slots.entry(uri.to_string()).or_default());
        *slot.entry.write() = Some(entry);
        Ok(())
    }

    /// Walk the cache directory and re-register every object that has a
    /// parseable meta sidecar and a data file. Bad sidecars are logged and
    /// skipped. Returns the number of recovered entries.
    pub async fn recover(&self) -> usize {
        let mut recovered = 0usize;
        let mut pending = vec![self.cache_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "cannot scan cache directory");
                    continue;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(dir = %dir.display(), error = %err, "cache directory scan aborted");
                        break;
                    }
                };
                let path = entry.path();
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                    continue;
                };
                if !name.ends_with(META_SUFFIX) {
                    continue;
                }
                match self.recover_sidecar(&path).await {
                    Ok(uri) => {
                        info!(uri, "recovered cache entry");
                        recovered += 1;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping meta sidecar");
                    }
                }
            }
        }
        recovered
    }

    async fn recover_sidecar(&self, meta_path: &Path) -> CacheResult<String> {
        let raw = fs::read(meta_path)
            .await
            .map_err(|err| CacheError::io("read meta sidecar", err))?;
        let meta: Meta =
            serde_json::from_slice(&raw).map_err(|err| CacheError::Meta(err.to_string()))?;

        let rel = meta_path
            .strip_prefix(&self.cache_dir)
            .ok()
            .and_then(|rel| rel.to_str())
            .ok_or_else(|| CacheError::InvalidKey(meta_path.display().to_string()))?;
        let object = rel
            .strip_suffix(META_SUFFIX)
            .ok_or_else(|| CacheError::InvalidKey(rel.to_string()))?;
        let uri = format!("/{object}");

        let (data_path, _) = self.object_paths(&uri)?;
        fs::metadata(&data_path)
            .await
            .map_err(|err| CacheError::io("orphaned sidecar, data file missing", err))?;

        self.add_meta(&uri, meta).await?;
        Ok(uri)
    }

    /// Revalidate the entry if its TTL has lapsed: refresh `expires` when
    /// the upstream metadata still matches, evict when the object changed
    /// or disappeared. Transient upstream failures keep the entry (stale
    /// beats absent).
    async fn validate(&self, ctx: &RequestContext, uri: &str) {
        let Some(upstream) = self.upstream.as_deref() else {
            return;
        };
        let slot = { self.slots.read().await.get(uri).cloned() };
        let Some(slot) = slot else {
            return;
        };
        let expired = match &*slot.entry.read() {
            Some(entry) => entry.meta.read().expires <= Utc::now(),
            None => return,
        };
        if !expired {
            return;
        }

        let _guard = slot.validate_lock.lock().await;
        // Re-check: another task may have revalidated while we queued.
        let cached = {
            match &*slot.entry.read() {
                Some(entry) => {
                    let meta = entry.meta.read().clone();
                    if meta.expires > Utc::now() {
                        return;
                    }
                    meta
                }
                None => return,
            }
        };

        debug!(seq = ctx.seq, uri, "meta expired, revalidating");
        match upstream.head(uri).await {
            Err(SourceError::NotFound) => {
                info!(seq = ctx.seq, uri, "object gone upstream, evicting");
                if let Err(err) = self.delete(ctx, uri).await {
                    error!(seq = ctx.seq, uri, error = %err, "eviction failed");
                }
            }
            Err(err) => {
                warn!(seq = ctx.seq, uri, error = %err, "revalidation failed, serving stale");
            }
            Ok(fresh) => {
                let unchanged = fresh.etag == cached.etag
                    && fresh.size == cached.size
                    && fresh.last_modified == cached.last_modified;
                if unchanged {
                    let refreshed = {
                        let entry = slot.entry.read().clone();
                        match entry {
                            Some(entry) => {
                                let mut meta = entry.meta.write();
                                meta.expires = Utc::now() + self.ttl;
                                meta.clone()
                            }
                            None => return,
                        }
                    };
                    debug!(seq = ctx.seq, uri, "upstream unchanged, expiry refreshed");
                    if let Err(err) = self.write_meta(uri, &refreshed).await {
                        error!(seq = ctx.seq, uri, error = %err, "failed to persist refreshed meta");
                    }
                } else {
                    info!(seq = ctx.seq, uri, "object changed upstream, evicting");
                    if let Err(err) = self.delete(ctx, uri).await {
                        error!(seq = ctx.seq, uri, error = %err, "eviction failed");
                    }
                }
            }
        }
    }

    async fn write_meta(&self, uri: &str, meta: &Meta) -> CacheResult<()> {
        let (_, meta_path) = self.object_paths(uri)?;
        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| CacheError::io("create cache directory", err))?;
        }
        let json =
            serde_json::to_vec_pretty(meta).map_err(|err| CacheError::Meta(err.to_string()))?;
        fs::write(&meta_path, json)
            .await
            .map_err(|err| CacheError::io("write meta sidecar", err))?;
        Ok(())
    }

    /// Map an object URI to its data-file and sidecar paths, rejecting keys
    /// that could escape the cache directory.
    fn object_paths(&self, uri: &str) -> CacheResult<(PathBuf, PathBuf)> {
        let key = uri.trim_start_matches('/');
        if key.is_empty()
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == 0)
        {
            return Err(CacheError::InvalidKey(uri.to_string()));
        }
        let data = data_path(&self.cache_dir, uri);
        let mut sidecar = data.clone().into_os_string();
        sidecar.push(META_SUFFIX);
        Ok((data, PathBuf::from(sidecar)))
    }
}
