//! The upstream boundary: anything that can serve object bytes, metadata,
//! and listings can back the cache.

pub mod s3_source;

pub use s3_source::S3Source;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::context::RequestContext;
use crate::models::meta::Meta;
use crate::services::faulting::FaultingFile;

#[derive(Debug, Error)]
pub enum SourceError {
    /// The object does not exist upstream. Recognized by the registry to
    /// evict during revalidation and mapped to 404 at the HTTP edge.
    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// A successfully started fetch: the faulting file is already streaming
/// into the cache, and `meta` describes the object. `meta.size` equals the
/// total number of bytes the stream will deliver.
pub struct FetchedObject {
    pub file: Arc<FaultingFile>,
    pub meta: Meta,
}

/// Contract every upstream driver implements. The driver owns the mapping
/// from object URIs to cache-file paths and holds its own handle on the
/// block store, so it can place (or divert) the data file as it sees fit.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Begin fetching the object's bytes; the returned faulting file is
    /// already streaming.
    async fn fetch(&self, ctx: &RequestContext, uri: &str) -> SourceResult<FetchedObject>;

    /// Metadata-only probe used for TTL revalidation.
    async fn head(&self, uri: &str) -> SourceResult<Meta>;

    /// Names of the entries directly under a directory-like prefix.
    async fn directory(&self, prefix: &str) -> SourceResult<Vec<String>>;
}
