//! Ingestion and processing for the EVP pipeline.
//!
//! This crate joins the stream primitives to the outside world:
//!
//! - [`service`] - the ingestion fast path (validate, dedup, append)
//! - [`worker`] - the stream consumer (claim, parse, buffer, bulk-write,
//!   acknowledge) with retry, dead-lettering and stale-claim recovery
//! - [`store`] - ports to the event store, dead-letter sink and credential
//!   store, plus in-memory adapters
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   IngestService  │  validate -> dedup claim -> stream append
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   EventStream    │  consumer group, pending entry list
//! └────────┬─────────┘
//!          │ read_group / claim_idle
//!          ▼
//! ┌──────────────────┐     exhausted retries     ┌────────────────┐
//! │      Worker      │ ─────────────────────────▶│ DeadLetterSink │
//! └────────┬─────────┘                           └────────────────┘
//!          │ bulk_insert (idempotent on event_id)
//!          ▼
//! ┌──────────────────┐
//! │    EventStore    │
//! └──────────────────┘
//! ```
//!
//! Delivery is at-least-once end to end; the unique index on `event_id`
//! collapses redelivery into a single stored record.

pub mod error;
pub mod service;
pub mod store;
pub mod worker;

// Re-export commonly used types at crate root
pub use error::{IngestError, StoreError, WorkerError};
pub use service::{BatchOutcome, IngestOutcome, IngestService, MAX_BATCH};
pub use store::{
    BulkInsertReport, Credential, CredentialStore, DeadLetterRecord, DeadLetterSink, EventStore,
    MemoryCredentialStore, MemoryDeadLetterSink, MemoryEventStore,
};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats, DEFAULT_GROUP};
