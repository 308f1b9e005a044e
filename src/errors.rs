//! Maps cache-core errors onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::services::CacheError;

/// A [`CacheError`] on its way out as an HTTP response.
///
/// The status is decided once, here at the edge: an object missing upstream
/// is 404, a key the cache refuses to map onto disk is 400, and everything
/// else (producer failures, disk trouble, a registry without an upstream)
/// is a plain 500.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        let status = match &err {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            CacheError::Upstream(_)
            | CacheError::Io { .. }
            | CacheError::Meta(_)
            | CacheError::NoUpstream => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}
