//! Stream worker: claim, parse, buffer, bulk-write, acknowledge.
//!
//! A [`Worker`] is a long-lived consumer of the event stream. One tokio
//! task owns all of its state; reads, flushes and the periodic stale-claim
//! pass are sequential awaits inside that task, so a flush in flight
//! naturally gates further reads. That sequencing is the backpressure
//! against a slow event store, and it bounds worker memory to roughly one
//! batch plus one claim pass of events.
//!
//! # Failure handling
//!
//! - Bulk-insert failures are retried with backoff and jitter; an
//!   exhausted batch is written to the dead-letter sink, and only a
//!   successful dead-letter write acknowledges the stream entries.
//! - If the dead-letter write fails too, nothing is acknowledged: the
//!   entries idle in the pending list until a claim-idle pass hands them
//!   to another worker. Redelivery may duplicate work but the store's
//!   unique index on `event_id` collapses it to one record.
//! - Unparseable entries are acknowledged and dropped so one bad record
//!   cannot wedge the stream.
//! - Any loop-level error drops the buffer (those entries are still
//!   pending and will redeliver) and backs off, protecting memory under
//!   sustained failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use evp_core::{generate_consumer_id, with_retry, Event, RetryConfig, RetryOutcome};
use evp_stream::{Entry, EntryId, EventStream, PipelineCounters};
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::store::{DeadLetterRecord, DeadLetterSink, EventStore};

/// Default consumer group workers join.
pub const DEFAULT_GROUP: &str = "evp-workers-group";

/// Tuning knobs for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer group to join.
    pub group: String,
    /// Unique consumer identity owning pending entries.
    pub consumer_id: String,
    /// Entries fetched per read.
    pub read_count: usize,
    /// Buffered events that trigger a flush.
    pub batch_size: usize,
    /// Flush a non-empty buffer after this long without one.
    pub batch_timeout: Duration,
    /// How long a read blocks on an empty stream.
    pub read_block: Duration,
    /// How often to look for stale pending entries.
    pub claim_interval: Duration,
    /// Idle age after which another consumer's entries are claimed.
    pub stale_age: Duration,
    /// Most entries claimed per stale pass.
    pub claim_batch: usize,
    /// Pause after a loop-level error.
    pub error_backoff: Duration,
    /// How long `stop` waits for the task before aborting it.
    pub shutdown_grace: Duration,
    /// Backoff policy for bulk inserts and dead-letter writes.
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            consumer_id: generate_consumer_id(),
            read_count: 50,
            batch_size: 100,
            batch_timeout: Duration::from_millis(500),
            read_block: Duration::from_millis(100),
            claim_interval: Duration::from_secs(30),
            stale_age: Duration::from_secs(60),
            claim_batch: 100,
            error_backoff: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

/// Lifetime totals a worker reports at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches_flushed: u64,
    pub events_processed: u64,
    pub events_dead_lettered: u64,
    pub entries_dropped: u64,
}

/// Spawns and owns the worker task.
pub struct Worker;

impl Worker {
    /// Start a worker task consuming from `stream` into `store`.
    ///
    /// The consumer group must already exist (see
    /// [`EventStream::ensure_group`]).
    pub fn spawn(
        config: WorkerConfig,
        stream: Arc<EventStream>,
        store: Arc<dyn EventStore>,
        dlq: Arc<dyn DeadLetterSink>,
        counters: Arc<PipelineCounters>,
    ) -> WorkerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let consumer_id = config.consumer_id.clone();
        let shutdown_grace = config.shutdown_grace;

        let task = WorkerTask {
            config,
            stream,
            store,
            dlq,
            counters,
            running: Arc::clone(&running),
            stats: WorkerStats::default(),
        };

        WorkerHandle {
            running,
            handle: tokio::spawn(task.run()),
            consumer_id,
            shutdown_grace,
        }
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<WorkerStats>,
    consumer_id: String,
    shutdown_grace: Duration,
}

impl WorkerHandle {
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Request a graceful stop and wait for the task.
    ///
    /// The loop finishes its current flush and makes one best-effort flush
    /// of a non-empty buffer. If it has not returned within the shutdown
    /// grace the task is aborted; un-acknowledged entries redeliver to the
    /// next owner.
    pub async fn stop(mut self) -> WorkerStats {
        self.running.store(false, Ordering::SeqCst);

        match tokio::time::timeout(self.shutdown_grace, &mut self.handle).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(join_error)) => {
                error!(
                    consumer_id = %self.consumer_id,
                    error = %join_error,
                    "worker task failed"
                );
                WorkerStats::default()
            }
            Err(_) => {
                warn!(
                    consumer_id = %self.consumer_id,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "worker did not stop within grace period, aborting"
                );
                self.handle.abort();
                WorkerStats::default()
            }
        }
    }
}

/// An event held in the buffer together with its stream entry.
struct BufferedEvent {
    entry_id: EntryId,
    event: Event,
}

struct WorkerTask {
    config: WorkerConfig,
    stream: Arc<EventStream>,
    store: Arc<dyn EventStore>,
    dlq: Arc<dyn DeadLetterSink>,
    counters: Arc<PipelineCounters>,
    running: Arc<AtomicBool>,
    stats: WorkerStats,
}

impl WorkerTask {
    async fn run(mut self) -> WorkerStats {
        info!(
            consumer_id = %self.config.consumer_id,
            group = %self.config.group,
            batch_size = self.config.batch_size,
            "worker started"
        );

        let mut buffer: Vec<BufferedEvent> = Vec::new();
        let mut last_flush = Instant::now();
        let mut last_claim = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self
                .tick(&mut buffer, &mut last_flush, &mut last_claim)
                .await
            {
                error!(
                    module = "worker",
                    consumer_id = %self.config.consumer_id,
                    buffered = buffer.len(),
                    error = %err,
                    "worker loop error; dropping buffer and backing off"
                );
                // Dropped events are still pending in the stream and will
                // redeliver; dropping bounds memory under sustained errors.
                buffer.clear();
                tokio::time::sleep(self.config.error_backoff).await;
            }
        }

        if !buffer.is_empty() {
            debug!(
                consumer_id = %self.config.consumer_id,
                buffered = buffer.len(),
                "final flush before shutdown"
            );
            self.flush(&mut buffer, &mut last_flush).await;
        }

        info!(
            consumer_id = %self.config.consumer_id,
            batches = self.stats.batches_flushed,
            events = self.stats.events_processed,
            dead_lettered = self.stats.events_dead_lettered,
            dropped = self.stats.entries_dropped,
            "worker stopped"
        );
        self.stats
    }

    /// One loop iteration: read, maybe flush, maybe reclaim.
    async fn tick(
        &mut self,
        buffer: &mut Vec<BufferedEvent>,
        last_flush: &mut Instant,
        last_claim: &mut Instant,
    ) -> Result<(), WorkerError> {
        let entries = self
            .stream
            .read_group(
                &self.config.group,
                &self.config.consumer_id,
                self.config.read_count,
                self.config.read_block,
            )
            .await?;
        self.absorb(entries, buffer);

        let timed_out =
            !buffer.is_empty() && last_flush.elapsed() >= self.config.batch_timeout;
        if buffer.len() >= self.config.batch_size || timed_out {
            self.flush(buffer, last_flush).await;
        }

        if last_claim.elapsed() >= self.config.claim_interval {
            *last_claim = Instant::now();
            let stale = self.stream.claim_idle(
                &self.config.group,
                &self.config.consumer_id,
                self.config.stale_age,
                self.config.claim_batch,
            )?;
            if !stale.is_empty() {
                info!(
                    consumer_id = %self.config.consumer_id,
                    count = stale.len(),
                    "took over stale pending entries"
                );
                self.absorb(stale, buffer);
                if buffer.len() >= self.config.batch_size {
                    self.flush(buffer, last_flush).await;
                }
            }
        }

        Ok(())
    }

    /// Parse entries into the buffer; acknowledge and drop the unparseable.
    fn absorb(&mut self, entries: Vec<Entry>, buffer: &mut Vec<BufferedEvent>) {
        for entry in entries {
            match Event::from_fields(&entry.fields) {
                Ok(event) => buffer.push(BufferedEvent {
                    entry_id: entry.id,
                    event,
                }),
                Err(err) => {
                    warn!(
                        module = "worker",
                        consumer_id = %self.config.consumer_id,
                        entry_id = %entry.id,
                        error = %err,
                        "acknowledging and dropping malformed entry"
                    );
                    if let Err(ack_err) = self.stream.acknowledge(&self.config.group, &[entry.id])
                    {
                        warn!(entry_id = %entry.id, error = %ack_err, "drop-ack failed");
                    }
                    metrics::counter!("worker_entries_dropped_total").increment(1);
                    self.stats.entries_dropped += 1;
                }
            }
        }
        metrics::gauge!("worker_buffer_events").set(buffer.len() as f64);
    }

    /// Write the buffered batch to the store and settle the stream.
    ///
    /// Acknowledgment only happens after the batch is durable somewhere:
    /// the event store on success, the dead-letter sink on exhausted
    /// retries. A failed dead-letter write leaves the entries pending.
    async fn flush(&mut self, buffer: &mut Vec<BufferedEvent>, last_flush: &mut Instant) {
        let batch = std::mem::take(buffer);
        metrics::gauge!("worker_buffer_events").set(0.0);
        let started = Instant::now();

        let events: Vec<Event> = batch.iter().map(|b| b.event.clone()).collect();
        let entry_ids: Vec<EntryId> = batch.iter().map(|b| b.entry_id).collect();

        let outcome = with_retry("bulk_insert", &self.config.retry, || {
            let store = Arc::clone(&self.store);
            let events = events.clone();
            async move { store.bulk_insert(&events).await }
        })
        .await;

        match outcome {
            RetryOutcome::Success { value: report, attempts } => {
                debug!(
                    consumer_id = %self.config.consumer_id,
                    inserted = report.inserted,
                    duplicates = report.duplicates,
                    attempts,
                    "batch flushed"
                );

                if let Err(err) = self.stream.acknowledge(&self.config.group, &entry_ids) {
                    // The inserts are idempotent; redelivery is harmless.
                    warn!(
                        consumer_id = %self.config.consumer_id,
                        error = %err,
                        "acknowledge failed after successful insert; entries will redeliver"
                    );
                }

                let types: Vec<String> =
                    events.iter().map(|e| e.event_type.clone()).collect();
                self.counters
                    .record_processed(events.len() as u64, &types, started.elapsed());
                self.stats.batches_flushed += 1;
                self.stats.events_processed += events.len() as u64;

                // Let other tasks breathe between flushes.
                tokio::task::yield_now().await;
            }
            RetryOutcome::Exhausted { error, attempts } => {
                error!(
                    module = "worker",
                    consumer_id = %self.config.consumer_id,
                    batch_size = batch.len(),
                    attempts,
                    error = %error,
                    "bulk insert exhausted retries; dead-lettering batch"
                );
                self.dead_letter(&batch, &entry_ids, &error.to_string(), attempts)
                    .await;
            }
        }

        *last_flush = Instant::now();
    }

    /// Route a permanently-failed batch to the dead-letter sink.
    async fn dead_letter(
        &mut self,
        batch: &[BufferedEvent],
        entry_ids: &[EntryId],
        error_message: &str,
        attempts: u32,
    ) {
        let failed_at = Utc::now();
        let records: Vec<DeadLetterRecord> = batch
            .iter()
            .map(|b| DeadLetterRecord {
                original_event_id: b.event.event_id.clone(),
                user_id: b.event.user_id.clone(),
                original_event_payload: serde_json::to_value(&b.event)
                    .unwrap_or(serde_json::Value::Null),
                error_message: error_message.to_string(),
                failed_at,
                retry_count: attempts,
                stream_entry_id: b.entry_id,
            })
            .collect();

        let outcome = with_retry("dlq_write", &self.config.retry, || {
            let dlq = Arc::clone(&self.dlq);
            let records = records.clone();
            async move { dlq.write(&records).await }
        })
        .await;

        match outcome {
            RetryOutcome::Success { value: written, .. } => {
                if let Err(err) = self.stream.acknowledge(&self.config.group, entry_ids) {
                    warn!(
                        consumer_id = %self.config.consumer_id,
                        error = %err,
                        "acknowledge failed after dead-letter write; entries will redeliver"
                    );
                }
                info!(
                    consumer_id = %self.config.consumer_id,
                    written,
                    total = records.len(),
                    "batch dead-lettered"
                );
                self.counters.record_failed(records.len() as u64);
                self.counters.record_dead_lettered(records.len() as u64);
                self.stats.events_dead_lettered += records.len() as u64;
            }
            RetryOutcome::Exhausted { error, attempts } => {
                // Last resort: leave everything pending. A claim-idle pass
                // hands the entries to another worker; the unique index on
                // event_id keeps the eventual re-insert idempotent.
                error!(
                    module = "worker",
                    consumer_id = %self.config.consumer_id,
                    batch_size = records.len(),
                    attempts,
                    error = %error,
                    "dead-letter write failed; leaving entries pending for redelivery"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryDeadLetterSink, MemoryEventStore};
    use evp_core::IngestRequest;
    use std::collections::HashMap;

    fn fast_config(consumer: &str) -> WorkerConfig {
        WorkerConfig {
            consumer_id: consumer.to_string(),
            read_count: 10,
            batch_size: 100,
            batch_timeout: Duration::from_millis(30),
            read_block: Duration::from_millis(10),
            claim_interval: Duration::from_secs(3600),
            stale_age: Duration::from_secs(3600),
            error_backoff: Duration::from_millis(20),
            retry: RetryConfig {
                max_retries: 2,
                base: Duration::from_millis(1),
                cap: Duration::from_millis(5),
                jitter_factor: 0.0,
            },
            ..Default::default()
        }
    }

    struct Rig {
        stream: Arc<EventStream>,
        store: Arc<MemoryEventStore>,
        dlq: Arc<MemoryDeadLetterSink>,
        counters: Arc<PipelineCounters>,
    }

    impl Rig {
        fn new() -> Self {
            let stream = Arc::new(EventStream::new());
            stream.ensure_group(DEFAULT_GROUP);
            Self {
                stream,
                store: Arc::new(MemoryEventStore::new()),
                dlq: Arc::new(MemoryDeadLetterSink::new()),
                counters: Arc::new(PipelineCounters::new()),
            }
        }

        fn spawn(&self, config: WorkerConfig) -> WorkerHandle {
            Worker::spawn(
                config,
                Arc::clone(&self.stream),
                Arc::clone(&self.store) as Arc<dyn EventStore>,
                Arc::clone(&self.dlq) as Arc<dyn DeadLetterSink>,
                Arc::clone(&self.counters),
            )
        }

        fn append_event(&self, id: &str) {
            let event = IngestRequest {
                event_id: Some(id.to_string()),
                event_type: Some("click".to_string()),
                user_id: Some("u1".to_string()),
                session_id: Some("s1".to_string()),
                timestamp: Some("2024-01-30T12:00:00Z".to_string()),
                ..Default::default()
            }
            .validate()
            .unwrap()
            .into_event(id.to_string(), "api-user", Utc::now());
            self.stream.append(event.to_fields()).unwrap();
        }

        fn pending(&self) -> usize {
            self.stream.info(DEFAULT_GROUP).unwrap().pending_count
        }
    }

    /// Poll until `condition` holds or two seconds pass.
    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    // =========================================================================
    // Happy path
    // =========================================================================

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let rig = Rig::new();
        let mut config = fast_config("w1");
        config.batch_size = 3;
        config.batch_timeout = Duration::from_secs(3600); // size trigger only

        for n in 0..3 {
            rig.append_event(&format!("evt_{n}"));
        }
        let handle = rig.spawn(config);

        assert!(wait_for(|| rig.store.count() == 3).await);
        assert!(wait_for(|| rig.pending() == 0).await);

        let stats = handle.stop().await;
        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.batches_flushed, 1);
    }

    #[tokio::test]
    async fn test_flush_on_batch_timeout() {
        let rig = Rig::new();
        // batch_size 100 will not trigger; the 30 ms timeout will
        let handle = rig.spawn(fast_config("w1"));

        rig.append_event("evt_a");
        rig.append_event("evt_b");

        assert!(wait_for(|| rig.store.count() == 2).await);
        assert!(rig.store.contains("evt_a"));
        assert!(rig.store.contains("evt_b"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_processed_events_are_acknowledged_and_counted() {
        let rig = Rig::new();
        let handle = rig.spawn(fast_config("w1"));

        for n in 0..5 {
            rig.append_event(&format!("evt_{n}"));
        }

        assert!(wait_for(|| rig.store.count() == 5).await);
        assert!(wait_for(|| rig.pending() == 0).await);

        handle.stop().await;
        let snap = rig.counters.snapshot();
        assert_eq!(snap.total_processed, 5);
        assert_eq!(snap.per_type["click"], 5);
    }

    // =========================================================================
    // Malformed entries
    // =========================================================================

    #[tokio::test]
    async fn test_malformed_entries_are_acked_and_dropped() {
        let rig = Rig::new();
        rig.stream
            .append(HashMap::from([("garbage".to_string(), "yes".to_string())]))
            .unwrap();
        rig.append_event("evt_ok");

        let handle = rig.spawn(fast_config("w1"));

        assert!(wait_for(|| rig.store.count() == 1).await);
        assert!(wait_for(|| rig.pending() == 0).await);

        let stats = handle.stop().await;
        assert_eq!(stats.entries_dropped, 1);
        assert_eq!(stats.events_processed, 1);
    }

    // =========================================================================
    // Failure and dead-letter paths
    // =========================================================================

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_and_ack() {
        let rig = Rig::new();
        rig.store.fail_writes(true);

        rig.append_event("evt_a");
        rig.append_event("evt_b");
        let handle = rig.spawn(fast_config("w1"));

        assert!(wait_for(|| rig.dlq.len() == 2).await);
        // Dead-lettered entries are acknowledged so they do not redeliver
        assert!(wait_for(|| rig.pending() == 0).await);
        assert_eq!(rig.store.count(), 0);

        let record = rig.dlq.get("evt_a").unwrap();
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.retry_count, 2);
        assert!(record.error_message.contains("injected"));

        let stats = handle.stop().await;
        assert_eq!(stats.events_dead_lettered, 2);
        let snap = rig.counters.snapshot();
        assert_eq!(snap.total_failed, 2);
        assert_eq!(snap.total_dead_lettered, 2);
    }

    #[tokio::test]
    async fn test_dlq_failure_leaves_entries_pending() {
        let rig = Rig::new();
        rig.store.fail_writes(true);
        rig.dlq.fail_writes(true);

        rig.append_event("evt_a");
        let handle = rig.spawn(fast_config("w1"));

        // Give the worker time to run the full retry ladder at least once
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(rig.dlq.len(), 0);
        assert_eq!(rig.store.count(), 0);
        assert_eq!(rig.pending(), 1, "entry must stay pending for reclaim");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_store_recovery_after_transient_failure() {
        let rig = Rig::new();
        // First bulk_insert attempt fails, retry succeeds
        rig.store.fail_next_writes(1);

        rig.append_event("evt_a");
        let handle = rig.spawn(fast_config("w1"));

        assert!(wait_for(|| rig.store.count() == 1).await);
        assert!(wait_for(|| rig.pending() == 0).await);
        assert!(rig.dlq.is_empty());
        handle.stop().await;
    }

    // =========================================================================
    // Claim-idle takeover
    // =========================================================================

    #[tokio::test]
    async fn test_stale_entries_are_taken_over() {
        let rig = Rig::new();
        for n in 0..3 {
            rig.append_event(&format!("evt_{n}"));
        }

        // A consumer reads and then dies without acknowledging
        rig.stream
            .read_group(DEFAULT_GROUP, "crashed-worker", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(rig.pending(), 3);

        let mut config = fast_config("rescuer");
        config.claim_interval = Duration::from_millis(20);
        config.stale_age = Duration::from_millis(1);
        let handle = rig.spawn(config);

        assert!(wait_for(|| rig.store.count() == 3).await);
        assert!(wait_for(|| rig.pending() == 0).await);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_takeover_after_insert_without_ack_is_idempotent() {
        let rig = Rig::new();
        rig.append_event("evt_a");

        // Simulate a worker that inserted but crashed before acknowledging
        let entries = rig
            .stream
            .read_group(DEFAULT_GROUP, "crashed-worker", 10, Duration::ZERO)
            .await
            .unwrap();
        let event = Event::from_fields(&entries[0].fields).unwrap();
        rig.store.bulk_insert(&[event]).await.unwrap();
        assert_eq!(rig.store.count(), 1);
        assert_eq!(rig.pending(), 1);

        let mut config = fast_config("rescuer");
        config.claim_interval = Duration::from_millis(20);
        config.stale_age = Duration::from_millis(1);
        let handle = rig.spawn(config);

        // Redelivery resolves to a no-op insert and an acknowledge
        assert!(wait_for(|| rig.pending() == 0).await);
        assert_eq!(rig.store.count(), 1);
        handle.stop().await;
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    #[tokio::test]
    async fn test_stop_flushes_remaining_buffer() {
        let rig = Rig::new();
        let mut config = fast_config("w1");
        config.batch_timeout = Duration::from_secs(3600); // no timeout flush

        let handle = rig.spawn(config);
        rig.append_event("evt_a");
        rig.append_event("evt_b");

        // Wait until the worker has read (entries pending, nothing stored)
        assert!(wait_for(|| rig.pending() == 2).await);
        assert_eq!(rig.store.count(), 0);

        let stats = handle.stop().await;
        assert_eq!(rig.store.count(), 2, "final flush must run");
        assert_eq!(stats.events_processed, 2);
    }

    #[tokio::test]
    async fn test_stop_is_prompt_on_idle_worker() {
        let rig = Rig::new();
        let handle = rig.spawn(fast_config("w1"));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = Instant::now();
        handle.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
