//! The caching core: block cache, faulting files, and the object registry.

pub mod block_store;
pub mod faulting;
pub mod registry;

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the caching core.
///
/// Cloneable so that a single failed block fill can be handed to every
/// waiter attached to the same single-flight fetch, and so a producer
/// failure can be replayed to late readers as a sticky error.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The upstream byte source failed mid-stream.
    #[error("upstream read failed: {0}")]
    Upstream(String),

    /// A local disk operation failed.
    #[error("{context}: {cause}")]
    Io {
        context: String,
        cause: Arc<std::io::Error>,
    },

    /// The metadata sidecar could not be encoded or decoded.
    #[error("meta sidecar: {0}")]
    Meta(String),

    /// The object does not exist upstream.
    #[error("`{0}` not found upstream")]
    NotFound(String),

    /// The key cannot be mapped onto the cache directory.
    #[error("invalid object key `{0}`")]
    InvalidKey(String),

    /// The registry has no upstream source and the entry is not cached.
    #[error("no upstream source configured")]
    NoUpstream,
}

impl CacheError {
    pub(crate) fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            cause: Arc::new(err),
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
