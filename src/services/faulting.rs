//! Faulting files: one producer streams the upstream into sequential
//! blocks, any number of readers consume them concurrently.
//!
//! The producer appends each block to the on-disk data file, publishes it
//! to the block store, and only then advances the published block count.
//! A reader that observes `blocks > i` can therefore always obtain block
//! `i`, either from memory or by faulting it back in from disk. Producer
//! progress is broadcast over a watch channel; readers waiting for a block
//! suspend on it instead of polling.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::watch;
use tracing::{trace, warn};

use super::block_store::BlockMap;
use super::{CacheError, CacheResult};
use crate::models::context::RequestContext;

/// Default block granularity: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// How long a published block stays in the in-memory store before it must
/// be faulted back in from disk.
const BLOCK_TTL: Duration = Duration::from_secs(3600);

/// Sequential byte source handed over by an upstream driver.
pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Clone, Copy, Debug)]
struct Progress {
    /// Blocks durably written and published, monotonically non-decreasing.
    blocks: u64,
    /// The producer has terminated (normally or with a sticky error).
    done: bool,
}

/// Per-object producer state bridging the upstream stream, the data file,
/// and the in-memory block store.
pub struct FaultingFile {
    dst: PathBuf,
    size: u64,
    block_size: usize,
    blocks: BlockMap,
    source: Mutex<Option<ByteSource>>,
    streaming: AtomicBool,
    upstream_err: RwLock<Option<CacheError>>,
    progress: watch::Sender<Progress>,
}

impl FaultingFile {
    /// Create the parent directory and (if absent) the destination file.
    ///
    /// An existing file is not truncated: recovery re-opens data files that
    /// already hold a complete object. With `source` set to `None` the file
    /// is recovery-only — every block faults in from disk.
    pub async fn new(
        source: Option<ByteSource>,
        dst: impl Into<PathBuf>,
        size: u64,
        blocks: BlockMap,
    ) -> CacheResult<Self> {
        let dst = dst.into();
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| CacheError::io("create cache directory", err))?;
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(&dst)
            .await
            .map_err(|err| CacheError::io("create cache file", err))?;

        let block_size = DEFAULT_BLOCK_SIZE;
        let initial = match source {
            // Recovered entries start fully faultable.
            None => Progress {
                blocks: size.div_ceil(block_size as u64),
                done: true,
            },
            Some(_) => Progress {
                blocks: 0,
                done: false,
            },
        };
        let (progress, _) = watch::channel(initial);

        Ok(Self {
            dst,
            size,
            block_size,
            blocks,
            source: Mutex::new(source),
            streaming: AtomicBool::new(false),
            upstream_err: RwLock::new(None),
            progress,
        })
    }

    /// Change the block granularity. Only callable before `stream`, which
    /// the exclusive borrow enforces.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
        if self.source.lock().is_none() {
            self.progress.send_replace(Progress {
                blocks: self.size.div_ceil(block_size as u64),
                done: true,
            });
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks the producer has published so far.
    pub fn block_count(&self) -> u64 {
        self.progress.borrow().blocks
    }

    /// Terminal producer error, if any. Sticky once set.
    pub fn upstream_error(&self) -> Option<CacheError> {
        self.upstream_err.read().clone()
    }

    /// Start the producer. A recovery-only file (no source) is already
    /// complete and ignores the call.
    pub fn stream(self: &Arc<Self>) {
        if self.streaming.swap(true, Ordering::SeqCst) {
            warn!(dst = %self.dst.display(), "stream() called twice, ignoring");
            return;
        }
        let Some(source) = self.source.lock().take() else {
            return;
        };
        let file = Arc::clone(self);
        tokio::spawn(async move {
            file.run_producer(source).await;
        });
    }

    async fn run_producer(&self, mut source: ByteSource) {
        if let Err(err) = self.produce(&mut source).await {
            warn!(dst = %self.dst.display(), error = %err, "producer terminated early");
            // Store the error before waking readers so anyone released by
            // the final send observes it.
            *self.upstream_err.write() = Some(err);
        }
        self.progress.send_modify(|p| p.done = true);
    }

    async fn produce(&self, source: &mut ByteSource) -> CacheResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.dst)
            .await
            .map_err(|err| CacheError::io("open cache file for writing", err))?;

        let mut bytes_read: u64 = 0;
        while bytes_read < self.size {
            let mut buf = vec![0u8; self.block_size];
            let filled = read_full(source, &mut buf)
                .await
                .map_err(|err| CacheError::Upstream(err.to_string()))?;
            if filled == 0 {
                return Err(CacheError::Upstream(format!(
                    "source ended {} bytes early",
                    self.size - bytes_read
                )));
            }

            file.write_all(&buf[..filled])
                .await
                .map_err(|err| CacheError::io("write cache file", err))?;
            // The count may only advance once the block is observable on
            // disk: a reader that sees `blocks > index` is allowed to fault
            // it straight back in.
            file.flush()
                .await
                .map_err(|err| CacheError::io("flush cache file", err))?;
            bytes_read += filled as u64;

            let mut block = Bytes::from(buf);
            block.truncate(filled);
            let index = self.progress.borrow().blocks;
            self.blocks.set(index, block, BLOCK_TTL);
            self.progress.send_modify(|p| p.blocks += 1);
            trace!(dst = %self.dst.display(), index, bytes_read, "published block");
        }

        Ok(())
    }

    /// Fetch block `index`, waiting for the producer if it has not been
    /// published yet and faulting it in from disk if it was evicted.
    pub async fn get_block(&self, ctx: &RequestContext, index: u64) -> CacheResult<Bytes> {
        let mut rx = self.progress.subscribe();
        loop {
            let progress = *rx.borrow_and_update();
            if index < progress.blocks {
                break;
            }
            if let Some(err) = self.upstream_error() {
                return Err(err);
            }
            if progress.done {
                return Err(CacheError::Upstream(format!(
                    "block {index} past end of {}-block object",
                    progress.blocks
                )));
            }
            if rx.changed().await.is_err() {
                return Err(self
                    .upstream_error()
                    .unwrap_or_else(|| CacheError::Upstream("producer vanished".into())));
            }
        }

        trace!(seq = ctx.seq, index, "serving block");
        self.blocks
            .fetch(index, BLOCK_TTL, || self.fault_in(index))
            .await
    }

    /// Rebuild a block from the data file.
    async fn fault_in(&self, index: u64) -> CacheResult<Bytes> {
        let offset = index * self.block_size as u64;
        let want = self
            .block_size
            .min(self.size.saturating_sub(offset) as usize);
        trace!(dst = %self.dst.display(), index, want, "faulting block from disk");

        let mut file = File::open(&self.dst)
            .await
            .map_err(|err| CacheError::io("open cache file", err))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| CacheError::io("seek cache file", err))?;

        let mut buf = vec![0u8; want];
        let mut filled = 0usize;
        while filled < want {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|err| CacheError::io("read cache file", err))?;
            if n == 0 {
                // Short file; the tail stays zeroed.
                break;
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }
}

/// Fill `buf` from `source`, tolerating a short read at end of stream.
async fn read_full(source: &mut ByteSource, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A linear byte-stream cursor over one [`FaultingFile`], owned by exactly
/// one consumer. Readers share the file but nothing else; each tracks its
/// own offset and may run ahead of or behind its peers, but never ahead of
/// the producer.
pub struct FaultingReader {
    file: Arc<FaultingFile>,
    ctx: RequestContext,
    bytes_read: u64,
}

impl FaultingReader {
    pub fn new(file: Arc<FaultingFile>, ctx: RequestContext) -> Self {
        Self {
            file,
            ctx,
            bytes_read: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Copy up to `buf.len()` bytes into `buf`, never crossing a block
    /// boundary. Returns 0 at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> CacheResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.chunk(buf.len()).await? {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    /// The rest of the current block as a zero-copy chunk, or `None` at end
    /// of stream.
    pub async fn next_chunk(&mut self) -> CacheResult<Option<Bytes>> {
        self.chunk(usize::MAX).await
    }

    async fn chunk(&mut self, limit: usize) -> CacheResult<Option<Bytes>> {
        if self.bytes_read >= self.file.size() {
            return Ok(None);
        }
        let block_size = self.file.block_size() as u64;
        let index = self.bytes_read / block_size;
        let offset = (self.bytes_read - index * block_size) as usize;

        let block = self.file.get_block(&self.ctx, index).await?;
        let end = block.len().min(offset.saturating_add(limit));
        if offset >= end {
            // The block is shorter than the declared size claims, which only
            // happens when the producer failed partway through it.
            return Err(self
                .file
                .upstream_error()
                .unwrap_or_else(|| CacheError::Upstream("truncated block".into())));
        }
        let chunk = block.slice(offset..end);
        self.bytes_read += chunk.len() as u64;
        Ok(Some(chunk))
    }
}

/// Helper shared by the registry and upstream drivers: map an object id to
/// its data-file path under `cache_dir`.
pub fn data_path(cache_dir: &Path, uri: &str) -> PathBuf {
    cache_dir.join(uri.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::block_store::BlockStore;
    use std::io::Cursor;

    fn integer_stream(n: usize) -> Vec<u8> {
        let mut content = Vec::new();
        for i in 0..n {
            content.extend_from_slice(format!("{i} ").as_bytes());
        }
        content
    }

    fn source_over(content: Vec<u8>) -> ByteSource {
        Box::pin(Cursor::new(content))
    }

    async fn streamed_file(content: Vec<u8>, block_size: usize, dst: &Path) -> Arc<FaultingFile> {
        let store = BlockStore::new(1 << 20);
        let size = content.len() as u64;
        let mut file = FaultingFile::new(
            Some(source_over(content)),
            dst,
            size,
            store.partition("/test/object"),
        )
        .await
        .unwrap();
        file.set_block_size(block_size);
        let file = Arc::new(file);
        file.stream();
        file
    }

    #[tokio::test]
    async fn producer_writes_the_whole_object_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let content = integer_stream(1000);
        let dst = dir.path().join("object");
        let file = streamed_file(content.clone(), 3, &dst).await;

        let mut reader = FaultingReader::new(Arc::clone(&file), RequestContext::next());
        let mut drained = Vec::new();
        loop {
            match reader.next_chunk().await.unwrap() {
                Some(chunk) => drained.extend_from_slice(&chunk),
                None => break,
            }
        }
        assert_eq!(drained, content);
        assert!(file.upstream_error().is_none());
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), content);
    }

    #[tokio::test]
    async fn no_empty_terminal_block_for_exact_multiples() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![7u8; 64];
        let dst = dir.path().join("object");
        let file = streamed_file(content.clone(), 16, &dst).await;

        let mut reader = FaultingReader::new(Arc::clone(&file), RequestContext::next());
        let mut drained = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            drained.extend_from_slice(&chunk);
        }
        assert_eq!(drained.len(), 64);
        assert_eq!(file.block_count(), 4);
    }

    #[tokio::test]
    async fn reads_never_cross_block_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let content = integer_stream(1000);
        let file = streamed_file(content.clone(), 11, &dir.path().join("object")).await;

        let mut reader = FaultingReader::new(file, RequestContext::next());
        let mut buf1 = [0u8; 10];
        let n = reader.read(&mut buf1).await.unwrap();
        assert_eq!(&buf1[..n], b"0 1 2 3 4 ");

        // Only one byte left in the first 11-byte block.
        let mut buf2 = [0u8; 20];
        let n = reader.read(&mut buf2).await.unwrap();
        assert_eq!(&buf2[..n], b"5");

        let n = reader.read(&mut buf2).await.unwrap();
        assert_eq!(&buf2[..n], b" 6 7 8 9 10");
    }

    #[tokio::test]
    async fn blocks_fault_in_from_disk_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let content = integer_stream(1000);
        // A tiny budget so every published block is evicted immediately.
        let store = BlockStore::new(8);
        let size = content.len() as u64;
        let dst = dir.path().join("object");
        let mut file = FaultingFile::new(
            Some(source_over(content.clone())),
            &dst,
            size,
            store.partition("/test/object"),
        )
        .await
        .unwrap();
        file.set_block_size(64);
        let file = Arc::new(file);
        file.stream();

        let mut reader = FaultingReader::new(file, RequestContext::next());
        let mut drained = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            drained.extend_from_slice(&chunk);
        }
        assert_eq!(drained, content);
    }

    #[tokio::test]
    async fn premature_end_of_source_sets_sticky_error() {
        let dir = tempfile::tempdir().unwrap();
        let content = integer_stream(100);
        let declared = content.len() as u64 * 2;
        let store = BlockStore::new(1 << 20);
        let file = FaultingFile::new(
            Some(source_over(content)),
            dir.path().join("object"),
            declared,
            store.partition("/test/object"),
        )
        .await
        .unwrap();
        let file = Arc::new(file);
        file.stream();

        let mut reader = FaultingReader::new(Arc::clone(&file), RequestContext::next());
        let mut drained = 0usize;
        let err = loop {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => drained += chunk.len(),
                Ok(None) => panic!("reader reached EOF past a failed producer"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, CacheError::Upstream(_)));
        assert!(drained < declared as usize);
        assert!(file.upstream_error().is_some());
    }

    #[tokio::test]
    async fn recovered_file_serves_from_disk_without_a_source() {
        let dir = tempfile::tempdir().unwrap();
        let content = integer_stream(500);
        let dst = dir.path().join("object");
        tokio::fs::write(&dst, &content).await.unwrap();

        let store = BlockStore::new(1 << 20);
        let mut file = FaultingFile::new(None, &dst, content.len() as u64, store.partition("/x"))
            .await
            .unwrap();
        file.set_block_size(32);
        let file = Arc::new(file);

        assert_eq!(
            file.block_count(),
            (content.len() as u64).div_ceil(32)
        );

        let mut reader = FaultingReader::new(file, RequestContext::next());
        let mut drained = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            drained.extend_from_slice(&chunk);
        }
        assert_eq!(drained, content);
    }

    #[tokio::test]
    async fn published_blocks_are_always_retrievable() {
        let dir = tempfile::tempdir().unwrap();
        let content = integer_stream(2000);
        let file = streamed_file(content, 7, &dir.path().join("object")).await;
        let ctx = RequestContext::next();

        // Whatever count the producer has reached, every block below it
        // must already be servable.
        loop {
            let count = file.block_count();
            for index in 0..count {
                file.get_block(&ctx, index).await.unwrap();
            }
            if count * 7 >= file.size() {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_readers_have_independent_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let content = integer_stream(5000);
        let file = streamed_file(content.clone(), 128, &dir.path().join("object")).await;

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let mut reader = FaultingReader::new(Arc::clone(&file), RequestContext::next());
            tasks.push(tokio::spawn(async move {
                let mut drained = Vec::new();
                while let Some(chunk) = reader.next_chunk().await.unwrap() {
                    drained.extend_from_slice(&chunk);
                }
                drained
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), content);
        }
    }
}
