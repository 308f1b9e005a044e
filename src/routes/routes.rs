//! Defines routes for the proxy surface.
//!
//! ## Structure
//! - **Service endpoints**
//!   - `GET    /healthz` — liveness
//!   - `GET    /readyz` — readiness (disk probe)
//!   - `GET    /favicon.ico` — always 404
//!
//! - **Object endpoints**
//!   - `GET    /{*path}` — object bytes, or a directory listing when the
//!     path ends in `/`
//!   - `DELETE /{*path}` — drop the cached entry
//!
//! The wildcard `*path` spans nested keys like `/bucket/photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        proxy_handlers::{delete_object, favicon, get_object},
    },
    services::registry::ObjectRegistry,
};
use axum::{
    Router,
    routing::get,
};
use std::sync::Arc;

/// Build and return the router for the whole proxy surface.
///
/// The router carries shared state (`Arc<ObjectRegistry>`) to all handlers.
/// Static routes win over the wildcard, so the service endpoints shadow
/// any objects of the same name.
pub fn routes() -> Router<Arc<ObjectRegistry>> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/favicon.ico", get(favicon))
        // Object-level routes; bare "/" lists the root
        .route("/", get(get_object))
        .route("/{*path}", get(get_object).delete(delete_object))
}
