//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks cache-directory disk I/O

use crate::services::registry::ObjectRegistry;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness hinges on the cache directory accepting round-trip I/O,
/// since every cache fill has to land there. HTTP 200 when the probe
/// passes, 503 with the failure detail otherwise.
pub async fn readyz(State(registry): State<Arc<ObjectRegistry>>) -> impl IntoResponse {
    let probe = probe_cache_dir(registry.cache_dir()).await;
    let ready = probe.is_ok();

    let checks = HashMap::from([(
        "cache_dir",
        CheckStatus {
            ok: ready,
            error: probe.err().map(|err| err.to_string()),
        },
    )]);
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Write a throwaway file under `dir`, read it back, and remove it.
///
/// Removal is attempted even when the read-back fails, so a flaky probe
/// does not litter the cache directory.
async fn probe_cache_dir(dir: &Path) -> io::Result<()> {
    let marker = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&marker, b"readyz").await?;
    let read_back = fs::read(&marker).await;
    let removed = fs::remove_file(&marker).await;

    if read_back? != b"readyz" {
        return Err(io::Error::other("probe file round-trip mismatch"));
    }
    removed?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
