//! HTTP ingest API for the EVP pipeline.
//!
//! This crate exposes the producer-facing surface:
//!
//! - `POST /v1/events` and `POST /v1/events/batch` - the ingestion fast
//!   path (validate, dedup, append; never a store write)
//! - `GET /v1/events/stats` - ingestion rate and totals
//! - `GET /health` - liveness
//!
//! Authentication is an `x-api-key` header checked against the credential
//! store by SHA-256 hash. The binary in this crate wires the in-process
//! pipeline (stream, dedup index, counters, worker pool) around the
//! router.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

// Re-export commonly used types at crate root
pub use auth::{generate_api_key, hash_api_key, SourceUser, API_KEY_HEADER, API_KEY_PREFIX};
pub use error::ApiError;
pub use routes::router;
pub use state::{AppState, Config};
