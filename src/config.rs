use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub max_cache_mb: u64,
    pub cache_dir: String,
    pub region: String,
    pub ttl_seconds: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Caching reverse proxy for S3-style object stores")]
pub struct Args {
    /// Port to listen on (overrides S3_CACHE_PROXY_PORT)
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// In-memory block cache budget in MB (overrides S3_CACHE_PROXY_MAX_CACHE_MB)
    #[arg(short = 'm', long)]
    pub max_cache_mb: Option<u64>,

    /// Cache directory (overrides S3_CACHE_PROXY_CACHE_DIR)
    #[arg(short = 'c', long)]
    pub cache_dir: Option<String>,

    /// Upstream S3 region (overrides S3_CACHE_PROXY_REGION)
    #[arg(short = 'r', long)]
    pub region: Option<String>,

    /// Seconds before cached objects are revalidated (overrides S3_CACHE_PROXY_TTL)
    #[arg(short = 't', long)]
    pub ttl_seconds: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_port = parse_env_number::<u16>("S3_CACHE_PROXY_PORT", 8080)?;
        let env_cache_mb = parse_env_number::<u64>("S3_CACHE_PROXY_MAX_CACHE_MB", 1000)?;
        let env_ttl = parse_env_number::<u64>("S3_CACHE_PROXY_TTL", 600)?;
        let env_region = env::var("S3_CACHE_PROXY_REGION").unwrap_or_else(|_| "us-west-2".into());
        let env_cache_dir = match env::var("S3_CACHE_PROXY_CACHE_DIR") {
            Ok(value) => Some(value),
            Err(_) => None,
        };

        // --- Merge ---
        let cache_dir = match args.cache_dir.or(env_cache_dir) {
            Some(dir) => dir,
            None => env::current_dir()
                .context("determining current working directory")?
                .to_string_lossy()
                .into_owned(),
        };
        // A trailing '/' breaks the sidecar path arithmetic downstream.
        let cache_dir = cache_dir.trim_end_matches('/').to_string();

        Ok(Self {
            port: args.port.unwrap_or(env_port),
            max_cache_mb: args.max_cache_mb.unwrap_or(env_cache_mb),
            cache_dir,
            region: args.region.unwrap_or(env_region),
            ttl_seconds: args.ttl_seconds.unwrap_or(env_ttl),
        })
    }

    pub fn addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_mb * 1024 * 1024
    }
}

fn parse_env_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
