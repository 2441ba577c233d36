//! Ports to the external stores, with in-memory adapters.
//!
//! The pipeline's collaborators are modeled as traits so the processing
//! code never depends on a concrete backend:
//!
//! - [`EventStore`] - the sharded document collection events land in;
//!   bulk inserts are unordered and keyed on `event_id` (unique index), so
//!   redelivered events produce per-document conflicts counted as success
//! - [`DeadLetterSink`] - durable store for events that exhausted their
//!   retries, upserted on `original_event_id`
//! - [`CredentialStore`] - API-key master data, looked up by key hash
//!
//! The `Memory*` adapters back the test suite and the single-process
//! deployment; they support failure injection so retry and dead-letter
//! paths can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evp_core::Event;
use evp_stream::EntryId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Result of a bulk insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkInsertReport {
    /// Documents newly inserted.
    pub inserted: usize,
    /// Documents skipped on a unique-key conflict (already persisted).
    pub duplicates: usize,
}

/// The document store events are bulk-written to.
///
/// Contract: the insert is `ordered=false`-equivalent, `event_id` carries
/// a unique index, and per-document conflicts on it are treated as
/// success, not failure. Production deployments shard the collection by
/// hashed `user_id`.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn bulk_insert(&self, events: &[Event]) -> Result<BulkInsertReport, StoreError>;
}

/// An event that exhausted its retries, preserved with context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_event_id: String,
    pub user_id: String,
    /// The full event as it would have been stored, verbatim.
    pub original_event_payload: serde_json::Value,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    /// Bulk-insert attempts spent before giving up.
    pub retry_count: u32,
    pub stream_entry_id: EntryId,
}

/// Durable sink for permanently-failed events.
///
/// Writes are upserts keyed on `original_event_id`, so a batch
/// re-processed after a claim-idle takeover lands on the same records.
/// On failure the caller must NOT acknowledge the source stream entries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Returns the number of records newly stored (existing ids are
    /// silently skipped).
    async fn write(&self, records: &[DeadLetterRecord]) -> Result<usize, StoreError>;
}

/// An API-key record from the credential master data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub role: String,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Whether the credential may be used at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some_and(|t| t <= now) {
            return false;
        }
        if self.expires_at.is_some_and(|t| t <= now) {
            return false;
        }
        true
    }
}

/// API-key lookup by SHA-256 hash of the raw key.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup_by_hash(&self, api_key_hash: &str) -> Result<Option<Credential>, StoreError>;
}

// =============================================================================
// In-memory adapters
// =============================================================================

/// In-memory [`EventStore`] with failure injection.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<HashMap<String, Event>>,
    fail_all: AtomicBool,
    fail_next: AtomicUsize,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.events.lock().contains_key(event_id)
    }

    pub fn get(&self, event_id: &str) -> Option<Event> {
        self.events.lock().get(event_id).cloned()
    }

    /// Make every subsequent `bulk_insert` fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` `bulk_insert` calls fail, then recover.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn bulk_insert(&self, events: &[Event]) -> Result<BulkInsertReport, StoreError> {
        if self.should_fail() {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        let mut stored = self.events.lock();
        let mut report = BulkInsertReport::default();
        for event in events {
            // Unique index on event_id: conflicts are idempotent success
            if stored.contains_key(&event.event_id) {
                report.duplicates += 1;
            } else {
                stored.insert(event.event_id.clone(), event.clone());
                report.inserted += 1;
            }
        }
        Ok(report)
    }
}

/// In-memory [`DeadLetterSink`] with failure injection.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<HashMap<String, DeadLetterRecord>>,
    fail_all: AtomicBool,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn contains(&self, original_event_id: &str) -> bool {
        self.records.lock().contains_key(original_event_id)
    }

    pub fn get(&self, original_event_id: &str) -> Option<DeadLetterRecord> {
        self.records.lock().get(original_event_id).cloned()
    }

    /// Make every subsequent `write` fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn write(&self, records: &[DeadLetterRecord]) -> Result<usize, StoreError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        let mut stored = self.records.lock();
        let mut written = 0usize;
        for record in records {
            if !stored.contains_key(&record.original_event_id) {
                stored.insert(record.original_event_id.clone(), record.clone());
                written += 1;
            }
        }
        Ok(written)
    }
}

/// In-memory [`CredentialStore`], keyed by API-key hash.
#[derive(Default)]
pub struct MemoryCredentialStore {
    by_hash: Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential under the given key hash.
    pub fn insert(&self, api_key_hash: &str, credential: Credential) {
        self.by_hash
            .lock()
            .insert(api_key_hash.to_string(), credential);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup_by_hash(&self, api_key_hash: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.by_hash.lock().get(api_key_hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evp_core::IngestRequest;

    fn event(id: &str) -> Event {
        IngestRequest {
            event_id: Some(id.to_string()),
            event_type: Some("click".to_string()),
            user_id: Some("u1".to_string()),
            session_id: Some("s1".to_string()),
            timestamp: Some("2024-01-30T12:00:00Z".to_string()),
            ..Default::default()
        }
        .validate()
        .unwrap()
        .into_event(id.to_string(), "api-user", Utc::now())
    }

    // =========================================================================
    // MemoryEventStore
    // =========================================================================

    #[tokio::test]
    async fn test_bulk_insert_counts_conflicts_as_duplicates() {
        let store = MemoryEventStore::new();
        let report = store
            .bulk_insert(&[event("a"), event("b")])
            .await
            .unwrap();
        assert_eq!(report, BulkInsertReport { inserted: 2, duplicates: 0 });

        // Redelivery: same ids again plus one new
        let report = store
            .bulk_insert(&[event("a"), event("b"), event("c")])
            .await
            .unwrap();
        assert_eq!(report, BulkInsertReport { inserted: 1, duplicates: 2 });
        assert_eq!(store.count(), 3);
    }

    #[tokio::test]
    async fn test_fail_next_writes_recovers() {
        let store = MemoryEventStore::new();
        store.fail_next_writes(2);

        assert!(store.bulk_insert(&[event("a")]).await.is_err());
        assert!(store.bulk_insert(&[event("a")]).await.is_err());
        assert!(store.bulk_insert(&[event("a")]).await.is_ok());
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn test_fail_writes_toggle() {
        let store = MemoryEventStore::new();
        store.fail_writes(true);
        assert!(store.bulk_insert(&[event("a")]).await.is_err());
        store.fail_writes(false);
        assert!(store.bulk_insert(&[event("a")]).await.is_ok());
    }

    // =========================================================================
    // MemoryDeadLetterSink
    // =========================================================================

    fn dead_letter(id: &str) -> DeadLetterRecord {
        DeadLetterRecord {
            original_event_id: id.to_string(),
            user_id: "u1".to_string(),
            original_event_payload: serde_json::json!({"event_id": id}),
            error_message: "store unavailable".to_string(),
            failed_at: Utc::now(),
            retry_count: 3,
            stream_entry_id: EntryId(7),
        }
    }

    #[tokio::test]
    async fn test_dead_letter_write_is_upsert() {
        let sink = MemoryDeadLetterSink::new();
        assert_eq!(sink.write(&[dead_letter("a")]).await.unwrap(), 1);
        // Re-processing after a takeover writes the same id again
        assert_eq!(sink.write(&[dead_letter("a"), dead_letter("b")]).await.unwrap(), 1);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_dead_letter_failure_injection() {
        let sink = MemoryDeadLetterSink::new();
        sink.fail_writes(true);
        assert!(sink.write(&[dead_letter("a")]).await.is_err());
        assert!(sink.is_empty());
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    fn credential() -> Credential {
        Credential {
            user_id: "u1".to_string(),
            role: "producer".to_string(),
            revoked_at: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_credential_lookup() {
        let store = MemoryCredentialStore::new();
        store.insert("hash-1", credential());

        let found = store.lookup_by_hash("hash-1").await.unwrap();
        assert_eq!(found.unwrap().user_id, "u1");
        assert!(store.lookup_by_hash("hash-2").await.unwrap().is_none());
    }

    #[test]
    fn test_credential_is_active() {
        let now = Utc.with_ymd_and_hms(2024, 1, 30, 12, 0, 0).unwrap();
        let mut cred = credential();
        assert!(cred.is_active(now));

        cred.revoked_at = Some(now - chrono::Duration::hours(1));
        assert!(!cred.is_active(now));

        cred.revoked_at = None;
        cred.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!cred.is_active(now));

        cred.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(cred.is_active(now));
    }
}
