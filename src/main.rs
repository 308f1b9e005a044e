use anyhow::Result;
use axum::Router;
use std::{fs, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use s3_cache_proxy::{
    config,
    routes,
    services::{block_store::BlockStore, registry::ObjectRegistry},
    sources::S3Source,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting s3-cache-proxy with config: {:?}", cfg);

    // --- Ensure cache directory exists ---
    if !Path::new(&cfg.cache_dir).exists() {
        fs::create_dir_all(&cfg.cache_dir)?;
        tracing::info!("Created cache directory at {}", cfg.cache_dir);
    }

    // --- Initialize core services ---
    let block_store = BlockStore::new(cfg.max_cache_bytes());
    let source = S3Source::new(&cfg.region, &cfg.cache_dir, block_store.clone()).await;
    let registry = Arc::new(ObjectRegistry::new(
        &cfg.cache_dir,
        cfg.ttl_seconds,
        block_store,
        Some(Arc::new(source)),
    ));

    // --- Re-register whatever a previous run left on disk ---
    tracing::info!("Scanning {} for meta sidecars", cfg.cache_dir);
    let recovered = registry.recover().await;
    tracing::info!("Recovered {} cache entries", recovered);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(registry);

    // --- Start server ---
    let addr = cfg.addr();
    tracing::info!("Server listening on http://{}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
