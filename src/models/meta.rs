//! Per-object metadata persisted as a JSON sidecar next to the data file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix appended to an object's data path to name its metadata sidecar.
pub const META_SUFFIX: &str = "._meta_";

/// Metadata for one cached object.
///
/// Written to `<cache_dir>/<object>._meta_` before the first reader is
/// handed out, and read back on startup to re-register entries without
/// contacting the upstream.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Meta {
    /// Local wall-clock instant after which the entry must be revalidated.
    pub expires: DateTime<Utc>,

    /// Last-Modified as reported by the upstream.
    pub last_modified: DateTime<Utc>,

    /// Total object size in bytes, as declared by the upstream.
    pub size: u64,

    /// MIME type reported by the upstream.
    pub content_type: String,

    /// Upstream entity tag.
    pub etag: String,
}
