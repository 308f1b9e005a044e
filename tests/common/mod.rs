//! Shared test fixtures: a fake upstream source generating deterministic
//! integer streams, with per-bucket behaviors for error injection and
//! cache bypass.

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, ReadBuf};

use s3_cache_proxy::models::context::RequestContext;
use s3_cache_proxy::models::meta::Meta;
use s3_cache_proxy::services::block_store::BlockStore;
use s3_cache_proxy::services::faulting::{ByteSource, FaultingFile, data_path};
use s3_cache_proxy::sources::{FetchedObject, SourceError, SourceResult, UpstreamSource};

/// Content generated for `/bucket/n`: `"0 1 2 ... (n-1) "`.
pub fn integer_content(n: usize) -> Vec<u8> {
    let mut content = Vec::new();
    for i in 0..n {
        content.extend_from_slice(format!("{i} ").as_bytes());
    }
    content
}

/// Byte source yielding its content and then a clean EOF.
struct IntegerStreamSource {
    content: Vec<u8>,
    offset: usize,
}

impl IntegerStreamSource {
    fn new(content: Vec<u8>) -> Self {
        Self { content, offset: 0 }
    }
}

impl AsyncRead for IntegerStreamSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let offset = self.offset;
        let remaining = &self.content[offset..];
        if remaining.is_empty() {
            return Poll::Ready(Ok(()));
        }
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.offset += n;
        Poll::Ready(Ok(()))
    }
}

/// Byte source that fails once more than half its content has been
/// handed out.
struct ErroringSource {
    content: Vec<u8>,
    offset: usize,
}

impl ErroringSource {
    fn new(content: Vec<u8>) -> Self {
        Self { content, offset: 0 }
    }
}

impl AsyncRead for ErroringSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset > self.content.len() / 2 {
            return Poll::Ready(Err(io::Error::other("failed to read more than half")));
        }
        let offset = self.offset;
        let remaining = &self.content[offset..];
        if remaining.is_empty() {
            return Poll::Ready(Ok(()));
        }
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.offset += n;
        Poll::Ready(Ok(()))
    }
}

/// Fake upstream. Bucket semantics:
/// - `error`: the source fails after delivering half the declared bytes
/// - `uncached`: the data file is diverted to `/dev/null`
/// - anything else: a well-behaved integer stream persisted normally
pub struct FakeUpstreamSource {
    base_dir: PathBuf,
    block_store: BlockStore,
    block_size: Mutex<Option<usize>>,
    head_meta: Mutex<Option<Meta>>,
    listing: Mutex<Vec<String>>,
    fetches: AtomicUsize,
    heads: AtomicUsize,
}

impl FakeUpstreamSource {
    pub fn new(base_dir: &Path, block_store: BlockStore) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            block_store,
            block_size: Mutex::new(None),
            head_meta: Mutex::new(None),
            listing: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
        }
    }

    /// Force a small block size on every faulting file this fake creates.
    pub fn set_block_size(&self, block_size: usize) {
        *self.block_size.lock() = Some(block_size);
    }

    /// What `head` answers; `None` means upstream not-found.
    pub fn set_head_meta(&self, meta: Option<Meta>) {
        *self.head_meta.lock() = meta;
    }

    pub fn set_listing(&self, names: Vec<String>) {
        *self.listing.lock() = names;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn head_count(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamSource for FakeUpstreamSource {
    async fn fetch(&self, _ctx: &RequestContext, uri: &str) -> SourceResult<FetchedObject> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let trimmed = uri.trim_start_matches('/');
        let bucket = trimmed.split('/').next().unwrap_or("");
        let n: usize = trimmed
            .rsplit('/')
            .next()
            .and_then(|part| part.parse().ok())
            .unwrap_or(0);

        let content = integer_content(n);
        let size = content.len() as u64;

        let dst = if bucket == "uncached" {
            PathBuf::from("/dev/null")
        } else {
            data_path(&self.base_dir, uri)
        };
        let source: ByteSource = if bucket == "error" {
            Box::pin(ErroringSource::new(content))
        } else {
            Box::pin(IntegerStreamSource::new(content))
        };

        let partition = self.block_store.partition(uri);
        let mut file = FaultingFile::new(Some(source), dst, size, partition)
            .await
            .map_err(|err| SourceError::Other(anyhow::anyhow!(err)))?;
        if let Some(block_size) = *self.block_size.lock() {
            file.set_block_size(block_size);
        }
        let file = Arc::new(file);
        file.stream();

        let meta = Meta {
            expires: Utc::now(),
            last_modified: Utc::now(),
            size,
            content_type: "text/plain".to_string(),
            etag: format!("\"{n}\""),
        };
        Ok(FetchedObject { file, meta })
    }

    async fn head(&self, _uri: &str) -> SourceResult<Meta> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        match self.head_meta.lock().clone() {
            Some(meta) => Ok(meta),
            None => Err(SourceError::NotFound),
        }
    }

    async fn directory(&self, _prefix: &str) -> SourceResult<Vec<String>> {
        Ok(self.listing.lock().clone())
    }
}
