//! Ingestion fast path: validate, dedup, append, count.
//!
//! [`IngestService`] is what the HTTP handlers call. It never touches the
//! event store; an accepted event is durable in the stream and the worker
//! pool takes it from there. The p95 budget for this path is dominated by
//! the dedup claim and the stream append, both O(1).
//!
//! Duplicate submissions inside the dedup window are answered positively
//! (the event exists) without a second append, which is what makes client
//! retries free.

use std::sync::Arc;

use chrono::Utc;
use evp_core::{generate_event_id, IngestRequest, ValidationError};
use evp_stream::{Claim, DedupIndex, EventStream, PipelineCounters};
use tracing::{debug, warn};

use crate::error::IngestError;

/// Largest accepted batch.
pub const MAX_BATCH: usize = 1000;

/// Answer for a single ingested event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Newly admitted; durable in the stream.
    Accepted { event_id: String },
    /// Same `event_id` was admitted within the dedup window.
    Duplicate { event_id: String },
    /// Failed schema validation; nothing was admitted.
    Rejected(ValidationError),
}

/// Answer for a batch ingest.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Ids of newly admitted events, in submission order.
    pub accepted_ids: Vec<String>,
    /// Events answered as duplicates.
    pub duplicates: usize,
    /// Rejected events as `(submission index, error)`.
    pub rejected: Vec<(usize, ValidationError)>,
}

/// The ingestion service (shared, stateless besides its dependencies).
pub struct IngestService {
    stream: Arc<EventStream>,
    dedup: Arc<DedupIndex>,
    counters: Arc<PipelineCounters>,
    group: String,
}

impl IngestService {
    pub fn new(
        stream: Arc<EventStream>,
        dedup: Arc<DedupIndex>,
        counters: Arc<PipelineCounters>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            stream,
            dedup,
            counters,
            group: group.into(),
        }
    }

    /// Consumer group the appended entries are destined for.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Ingest a single event.
    ///
    /// Validate, claim the id, append, count. A stream failure after the
    /// dedup claim releases the claim so the client can retry without
    /// being answered as a duplicate.
    pub fn ingest(
        &self,
        request: &IngestRequest,
        source_user_id: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let draft = match request.validate() {
            Ok(draft) => draft,
            Err(error) => {
                metrics::counter!("ingest_events_rejected_total").increment(1);
                debug!(field = %error.field, "rejected event: {}", error.message);
                return Ok(IngestOutcome::Rejected(error));
            }
        };

        let event_id = draft.event_id.clone().unwrap_or_else(generate_event_id);

        if self.dedup.try_claim(&event_id) == Claim::Duplicate {
            self.counters.record_ingested(0, 1);
            return Ok(IngestOutcome::Duplicate { event_id });
        }

        let event = draft.into_event(event_id.clone(), source_user_id, Utc::now());
        if let Err(error) = self.stream.append(event.to_fields()) {
            warn!(event_id = %event_id, error = %error, "append failed; releasing dedup claim");
            self.dedup.clear(&event_id);
            return Err(error.into());
        }

        self.counters.record_ingested(1, 0);
        Ok(IngestOutcome::Accepted { event_id })
    }

    /// Ingest a batch of up to [`MAX_BATCH`] events.
    ///
    /// Dedup runs as one batch claim, appends are pipelined in submission
    /// order. If an append fails mid-batch, the not-yet-appended events are
    /// reported as rejected (not counted) and their dedup claims released,
    /// so retrying them is safe.
    pub fn ingest_batch(
        &self,
        requests: &[IngestRequest],
        source_user_id: &str,
    ) -> Result<BatchOutcome, IngestError> {
        if requests.is_empty() || requests.len() > MAX_BATCH {
            return Err(IngestError::InvalidBatchSize {
                len: requests.len(),
                max: MAX_BATCH,
            });
        }

        let mut outcome = BatchOutcome::default();

        // Validate everything first; only valid events participate in the
        // dedup claim.
        let mut candidates = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            match request.validate() {
                Ok(draft) => {
                    let event_id = draft.event_id.clone().unwrap_or_else(generate_event_id);
                    candidates.push((index, draft, event_id));
                }
                Err(error) => {
                    metrics::counter!("ingest_events_rejected_total").increment(1);
                    outcome.rejected.push((index, error));
                }
            }
        }

        let claim = self
            .dedup
            .try_claim_batch(candidates.iter().map(|(_, _, id)| id.as_str()));
        outcome.duplicates = claim.duplicates;

        // claim.new_ids preserves claim order, which is candidate order, so
        // a single forward walk matches each candidate to its claim result.
        let mut new_ids = claim.new_ids.iter().peekable();
        let mut append_failed = false;
        let mut accepted = 0u64;

        for (index, draft, event_id) in candidates {
            if new_ids.peek() != Some(&&event_id) {
                continue; // answered as duplicate
            }
            new_ids.next();

            if append_failed {
                self.dedup.clear(&event_id);
                outcome.rejected.push((
                    index,
                    ValidationError {
                        field: format!("events[{index}]"),
                        message: "not ingested: stream append failed".to_string(),
                    },
                ));
                continue;
            }

            let event = draft.into_event(event_id.clone(), source_user_id, Utc::now());
            match self.stream.append(event.to_fields()) {
                Ok(_) => {
                    accepted += 1;
                    outcome.accepted_ids.push(event_id);
                }
                Err(error) => {
                    warn!(
                        event_id = %event_id,
                        error = %error,
                        "append failed mid-batch; rejecting remainder"
                    );
                    append_failed = true;
                    self.dedup.clear(&event_id);
                    outcome.rejected.push((
                        index,
                        ValidationError {
                            field: format!("events[{index}]"),
                            message: "not ingested: stream append failed".to_string(),
                        },
                    ));
                }
            }
        }

        self.counters
            .record_ingested(accepted, outcome.duplicates as u64);
        Ok(outcome)
    }
}
