//! Core types for the EVP event-ingestion pipeline.
//!
//! This crate holds what every other pipeline crate shares:
//!
//! - [`event`] - the event domain model, ingest-payload validation and the
//!   stream field-map codec
//! - [`id`] - event-id and consumer-id generation
//! - [`retry`] - exponential backoff with bounded jitter
//! - [`metrics`] - Prometheus recorder setup and metric definitions
//! - [`error`] - shared error types
//!
//! # Pipeline shape
//!
//! ```text
//! ┌──────────────┐
//! │  Ingest API  │  validate -> dedup -> append -> ack (no store writes)
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │ Event Stream │  append-only log, consumer groups, pending entry list
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │   Workers    │  claim -> parse -> buffer -> bulk insert -> acknowledge
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │  EventStore  │  unique index on event_id makes redelivery a no-op
//! └──────────────┘
//! ```

pub mod error;
pub mod event;
pub mod id;
pub mod metrics;
pub mod retry;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use event::{Event, EventDraft, IngestRequest, ValidationError, DEFAULT_PRIORITY};
pub use id::{generate_consumer_id, generate_event_id, EVENT_ID_PREFIX};
pub use retry::{with_retry, RetryConfig, RetryOutcome};
