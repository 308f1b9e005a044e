//! Per-request correlation context threaded through cache operations.

use std::sync::atomic::{AtomicU64, Ordering};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifies one request across log lines in `get`, `delete`, and the
/// block-serving path.
#[derive(Clone, Copy, Debug)]
pub struct RequestContext {
    /// Process-wide request sequence number.
    pub seq: u64,
}

impl RequestContext {
    /// Allocate the next request sequence number.
    pub fn next() -> Self {
        Self {
            seq: REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}
