//! Caching reverse proxy for S3-style object stores.
//!
//! Objects are streamed from the upstream once, persisted to a local data
//! file, and chopped into fixed-size blocks held in a bounded in-memory
//! cache. Concurrent readers advance independently over a partially
//! downloaded object; blocks evicted from memory are faulted back in from
//! disk on demand.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod sources;
