//! Event domain model and ingest-payload validation.
//!
//! This module defines the two shapes an event takes inside the pipeline:
//!
//! - [`IngestRequest`] - the raw wire payload submitted by producers
//!   (camelCase keys, everything optional so validation can report precise
//!   field errors instead of opaque parse failures)
//! - [`Event`] - the validated, server-stamped record that flows through
//!   the stream and into the event store
//!
//! Validation is declarative and pre-compiled: the `event_type` pattern is
//! built once into a static, and the hot path does no allocation beyond the
//! error case.
//!
//! # Stream encoding
//!
//! Stream entries carry a flat `field -> string` map. [`Event::to_fields`]
//! and [`Event::from_fields`] are the codec; `metadata` and `payload` are
//! carried as opaque JSON blobs that workers never introspect.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Pattern an `event_type` must match (also bounded to 100 chars).
static EVENT_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*$").expect("valid event type regex"));

/// Maximum length of an `event_type`.
pub const EVENT_TYPE_MAX_LEN: usize = 100;

/// Default priority assigned when the producer omits the field.
pub const DEFAULT_PRIORITY: u8 = 1;

/// A single ingest-payload validation failure.
///
/// Carries the first failing field path and a human-readable message, per
/// the ingest API contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[error("invalid field '{field}': {message}")]
pub struct ValidationError {
    /// Wire-level field path (camelCase, as the producer sent it).
    pub field: String,
    /// What was wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Raw ingest payload as submitted by a producer.
///
/// All fields are optional at the serde layer so that missing-field errors
/// surface as [`ValidationError`]s with a field path; unknown top-level
/// fields are rejected at deserialization time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestRequest {
    /// Client-supplied event id; server-generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Source-supplied instant, ISO-8601 / RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Integer 0-3; defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

/// A validated ingest payload, not yet admitted to the pipeline.
///
/// Produced by [`IngestRequest::validate`]; becomes an [`Event`] once the
/// ingestion service assigns identity and stamps it.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_id: Option<String>,
    pub event_type: String,
    pub user_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub metadata: Map<String, Value>,
    pub payload: Map<String, Value>,
}

impl IngestRequest {
    /// Validate the payload against the ingest schema.
    ///
    /// Rules:
    /// - `eventType`, `userId`, `sessionId`, `timestamp` are required
    /// - `eventType` matches `^[A-Za-z][A-Za-z0-9_.\-]*$`, 1-100 chars
    /// - `timestamp` parses as RFC 3339
    /// - `priority` is an integer 0-3 (default 1)
    ///
    /// Returns the first failing field, wire-named.
    pub fn validate(&self) -> std::result::Result<EventDraft, ValidationError> {
        let event_type = require_non_empty(self.event_type.as_deref(), "eventType")?;
        if event_type.len() > EVENT_TYPE_MAX_LEN {
            return Err(ValidationError::new(
                "eventType",
                format!("must be at most {EVENT_TYPE_MAX_LEN} characters"),
            ));
        }
        if !EVENT_TYPE_RE.is_match(event_type) {
            return Err(ValidationError::new(
                "eventType",
                "must start with a letter and contain only letters, digits, '_', '.', '-'",
            ));
        }

        let user_id = require_non_empty(self.user_id.as_deref(), "userId")?;
        let session_id = require_non_empty(self.session_id.as_deref(), "sessionId")?;

        let raw_ts = require_non_empty(self.timestamp.as_deref(), "timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(raw_ts)
            .map_err(|e| ValidationError::new("timestamp", format!("not a valid instant: {e}")))?
            .with_timezone(&Utc);

        let priority = match self.priority {
            None => DEFAULT_PRIORITY,
            Some(p @ 0..=3) => p as u8,
            Some(_) => {
                return Err(ValidationError::new(
                    "priority",
                    "must be an integer between 0 and 3",
                ));
            }
        };

        if let Some(id) = self.event_id.as_deref()
            && id.is_empty()
        {
            return Err(ValidationError::new("eventId", "must not be empty"));
        }

        Ok(EventDraft {
            event_id: self.event_id.clone(),
            event_type: event_type.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            timestamp,
            priority,
            metadata: self.metadata.clone().unwrap_or_default(),
            payload: self.payload.clone().unwrap_or_default(),
        })
    }
}

fn require_non_empty<'a>(
    value: Option<&'a str>,
    field: &str,
) -> std::result::Result<&'a str, ValidationError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        Some(_) => Err(ValidationError::new(field, "must not be empty")),
        None => Err(ValidationError::new(field, "is required")),
    }
}

impl EventDraft {
    /// Stamp the draft into a pipeline [`Event`].
    ///
    /// `event_id` must already be resolved (client-supplied or generated);
    /// `source_user_id` is the API-key owner admitting the event.
    pub fn into_event(
        self,
        event_id: String,
        source_user_id: &str,
        ingested_at: DateTime<Utc>,
    ) -> Event {
        Event {
            event_id,
            user_id: self.user_id,
            session_id: self.session_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            priority: self.priority,
            metadata: self.metadata,
            payload: self.payload,
            ingested_at,
            source_user_id: source_user_id.to_string(),
        }
    }
}

/// A validated, server-stamped event.
///
/// `event_id` is the unit of idempotency across the whole pipeline: dedup,
/// stream redelivery and the store's unique index all key on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    /// Shard key for the event store.
    pub user_id: String,
    pub session_id: String,
    pub event_type: String,
    /// Source-supplied instant.
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    /// Opaque producer blob; stored verbatim, never parsed by workers.
    pub metadata: Map<String, Value>,
    /// Opaque producer blob; stored verbatim, never parsed by workers.
    pub payload: Map<String, Value>,
    /// Server-assigned at accept time.
    pub ingested_at: DateTime<Utc>,
    /// API-key owner that submitted the event (audit trail).
    pub source_user_id: String,
}

impl Event {
    /// Encode into the flat field map carried by a stream entry.
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::with_capacity(10);
        fields.insert("event_id".into(), self.event_id.clone());
        fields.insert("user_id".into(), self.user_id.clone());
        fields.insert("session_id".into(), self.session_id.clone());
        fields.insert("event_type".into(), self.event_type.clone());
        fields.insert("timestamp".into(), self.timestamp.to_rfc3339());
        fields.insert("priority".into(), self.priority.to_string());
        fields.insert(
            "metadata".into(),
            Value::Object(self.metadata.clone()).to_string(),
        );
        fields.insert(
            "payload".into(),
            Value::Object(self.payload.clone()).to_string(),
        );
        fields.insert("ingested_at".into(), self.ingested_at.to_rfc3339());
        fields.insert("source_user_id".into(), self.source_user_id.clone());
        fields
    }

    /// Decode a stream entry's field map back into an event.
    ///
    /// Fails on missing or unparseable fields; the worker acknowledges and
    /// drops such entries rather than blocking the stream.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| -> Result<&String> {
            fields
                .get(key)
                .ok_or_else(|| Error::MalformedEntry(format!("missing field '{key}'")))
        };

        let timestamp = parse_instant(get("timestamp")?, "timestamp")?;
        let ingested_at = parse_instant(get("ingested_at")?, "ingested_at")?;

        let priority: u8 = get("priority")?
            .parse()
            .map_err(|_| Error::MalformedEntry("non-numeric priority".into()))?;

        Ok(Self {
            event_id: get("event_id")?.clone(),
            user_id: get("user_id")?.clone(),
            session_id: get("session_id")?.clone(),
            event_type: get("event_type")?.clone(),
            timestamp,
            priority,
            metadata: parse_blob(get("metadata")?, "metadata")?,
            payload: parse_blob(get("payload")?, "payload")?,
            ingested_at,
            source_user_id: get("source_user_id")?.clone(),
        })
    }
}

fn parse_instant(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::MalformedEntry(format!("bad {field}: {e}")))
}

fn parse_blob(raw: &str, field: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::MalformedEntry(format!("{field} is not an object"))),
        Err(e) => Err(Error::MalformedEntry(format!("bad {field}: {e}"))),
    }
}
