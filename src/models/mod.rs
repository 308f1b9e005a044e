//! Core data models for the caching proxy.
//!
//! `Meta` is the JSON schema of the on-disk metadata sidecar; the request
//! context carries the sequence number used for log correlation.

pub mod context;
pub mod meta;
