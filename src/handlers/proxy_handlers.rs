//! HTTP handlers for the proxy surface.
//! Streams object bodies to avoid buffering in memory and delegates cache
//! concerns to `ObjectRegistry`.

use crate::{
    errors::AppError,
    models::{context::RequestContext, meta::Meta},
    services::registry::ObjectRegistry,
};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::Response,
};
use std::io;
use std::sync::Arc;
use tracing::{error, info};

/// Download an object, or list a directory when the path ends in `/`.
pub async fn get_object(
    State(registry): State<Arc<ObjectRegistry>>,
    uri: Uri,
) -> Result<Response, AppError> {
    let path = uri.path();
    let ctx = RequestContext::next();
    info!(seq = ctx.seq, path, "GET");

    if path.ends_with('/') {
        return list_directory(&registry, &ctx, path).await;
    }

    let reader = registry.get(&ctx, path).await?;
    let meta = registry.get_meta(path).await;

    // Readers pull one block at a time; an error mid-body means the
    // producer failed, and the entry is evicted before the stream aborts.
    // A client that goes away simply stops pulling, which evicts nothing.
    let stream_registry = Arc::clone(&registry);
    let stream_path = path.to_string();
    let stream = futures::stream::try_unfold(reader, move |mut reader| {
        let registry = Arc::clone(&stream_registry);
        let path = stream_path.clone();
        async move {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Ok(Some((chunk, reader))),
                Ok(None) => Ok(None),
                Err(err) => {
                    error!(seq = ctx.seq, path = %path, error = %err, "stream failed mid-body, evicting");
                    if let Err(del_err) = registry.delete(&ctx, &path).await {
                        error!(seq = ctx.seq, path = %path, error = %del_err, "eviction failed");
                    }
                    Err(io::Error::other(err))
                }
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    if let Some(meta) = meta {
        set_object_headers(response.headers_mut(), &meta);
    }
    Ok(response)
}

/// DELETE `/<path>` — drop the cached entry. Always 204.
pub async fn delete_object(
    State(registry): State<Arc<ObjectRegistry>>,
    uri: Uri,
) -> Result<StatusCode, AppError> {
    let ctx = RequestContext::next();
    info!(seq = ctx.seq, path = uri.path(), "DELETE");
    registry.delete(&ctx, uri.path()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Browsers ask for this on every visit; there is no favicon to serve.
pub async fn favicon() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn list_directory(
    registry: &ObjectRegistry,
    ctx: &RequestContext,
    path: &str,
) -> Result<Response, AppError> {
    let names = registry.directory(ctx, path).await?;
    let mut body = String::new();
    for name in &names {
        body.push_str(name);
        body.push('\n');
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Meta) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if !meta.etag.is_empty() {
        let quoted = format!("\"{}\"", meta.etag.trim_matches('"'));
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }

    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&meta.last_modified.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
}
