//! Rolling and cumulative pipeline counters.
//!
//! [`PipelineCounters`] backs the stats endpoint and mirrors everything
//! into the Prometheus recorder. Ingest throughput is tracked in
//! per-second buckets pruned after [`BUCKET_RETENTION`], so the rate query
//! is a sum over the trailing minute rather than a decaying average.
//!
//! Every operation here is infallible and cheap; a metrics update must
//! never fail an ingest or a processed batch.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// How long per-second ingest buckets are retained.
pub const BUCKET_RETENTION: Duration = Duration::from_secs(120);

/// Window over which [`PipelineCounters::ingest_rate`] averages.
pub const RATE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Default)]
struct CounterInner {
    /// unix second -> events accepted during that second.
    per_second: BTreeMap<i64, u64>,
    total_ingested: u64,
    total_duplicates: u64,
    total_processed: u64,
    total_failed: u64,
    total_dead_lettered: u64,
    per_type: HashMap<String, u64>,
    last_processed_at: Option<DateTime<Utc>>,
    last_batch_size: u64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterSnapshot {
    pub total_ingested: u64,
    pub total_duplicates: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_dead_lettered: u64,
    /// Events per second over the trailing minute.
    pub ingest_rate: f64,
    pub per_type: HashMap<String, u64>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_batch_size: u64,
}

/// Shared pipeline counters; clone-free via `Arc`.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    inner: Mutex<CounterInner>,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ingest outcome: `accepted` new events, `duplicates`
    /// rejected by the dedup index.
    pub fn record_ingested(&self, accepted: u64, duplicates: u64) {
        self.record_ingested_at(Utc::now(), accepted, duplicates);
    }

    fn record_ingested_at(&self, now: DateTime<Utc>, accepted: u64, duplicates: u64) {
        let second = now.timestamp();
        {
            let mut inner = self.inner.lock();
            if accepted > 0 {
                *inner.per_second.entry(second).or_insert(0) += accepted;
            }
            inner.total_ingested += accepted;
            inner.total_duplicates += duplicates;

            let horizon = second - BUCKET_RETENTION.as_secs() as i64;
            inner.per_second = inner.per_second.split_off(&horizon);
        }

        metrics::counter!("ingest_events_accepted_total").increment(accepted);
        metrics::counter!("ingest_events_duplicate_total").increment(duplicates);
    }

    /// Record a successfully flushed batch.
    pub fn record_processed(&self, batch_size: u64, event_types: &[String], elapsed: Duration) {
        {
            let mut inner = self.inner.lock();
            inner.total_processed += batch_size;
            inner.last_processed_at = Some(Utc::now());
            inner.last_batch_size = batch_size;
            for ty in event_types {
                *inner.per_type.entry(ty.clone()).or_insert(0) += 1;
            }
        }

        metrics::counter!("worker_events_processed_total").increment(batch_size);
        metrics::counter!("worker_batches_flushed_total").increment(1);
        metrics::histogram!("worker_flush_duration_seconds").record(elapsed.as_secs_f64());
    }

    /// Record events that exhausted bulk-insert retries.
    pub fn record_failed(&self, count: u64) {
        self.inner.lock().total_failed += count;
        metrics::counter!("worker_events_failed_total").increment(count);
    }

    /// Record events durably routed to the dead-letter sink.
    pub fn record_dead_lettered(&self, count: u64) {
        self.inner.lock().total_dead_lettered += count;
        metrics::counter!("worker_events_dead_lettered_total").increment(count);
    }

    /// Events per second averaged over the trailing minute.
    pub fn ingest_rate(&self) -> f64 {
        self.ingest_rate_at(Utc::now())
    }

    fn ingest_rate_at(&self, now: DateTime<Utc>) -> f64 {
        let second = now.timestamp();
        let inner = self.inner.lock();
        let sum: u64 = inner
            .per_second
            .range((second - RATE_WINDOW_SECS + 1)..=second)
            .map(|(_, count)| *count)
            .sum();
        sum as f64 / RATE_WINDOW_SECS as f64
    }

    /// Snapshot everything for the stats endpoint.
    pub fn snapshot(&self) -> CounterSnapshot {
        let rate = self.ingest_rate();
        metrics::gauge!("ingest_events_per_second").set(rate);

        let inner = self.inner.lock();
        CounterSnapshot {
            total_ingested: inner.total_ingested,
            total_duplicates: inner.total_duplicates,
            total_processed: inner.total_processed,
            total_failed: inner.total_failed,
            total_dead_lettered: inner.total_dead_lettered,
            ingest_rate: rate,
            per_type: inner.per_type.clone(),
            last_processed_at: inner.last_processed_at,
            last_batch_size: inner.last_batch_size,
        }
    }
}
