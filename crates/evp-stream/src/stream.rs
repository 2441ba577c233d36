//! Append-only event stream with consumer-group delivery.
//!
//! This module provides the [`EventStream`], the durable hand-off between
//! the ingest API and the worker pool:
//!
//! - entries are appended in FIFO order and get a monotonic [`EntryId`]
//! - a consumer group tracks a single cursor over the stream; each entry is
//!   delivered to exactly one group member at a time
//! - delivered-but-unacknowledged entries sit in the group's pending entry
//!   list (PEL) until they are acknowledged or reclaimed
//! - [`EventStream::claim_idle`] reassigns entries whose owner went quiet,
//!   so a crashed worker's batch is picked up by a healthy one
//!
//! Entries that every group has moved past and acknowledged are trimmed, so
//! memory is bounded by the un-acknowledged backlog plus whatever has not
//! been delivered yet. When that backlog reaches the configured capacity,
//! appends are refused and producers see backpressure.
//!
//! Readers block on an empty stream via [`tokio::sync::Notify`]; the lock
//! is never held across an await point.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Result, StreamError};

/// Default retention capacity (entries).
pub const DEFAULT_CAPACITY: usize = 1_000_000;

/// Monotonic identifier of a stream entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An entry as delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: EntryId,
    /// Flat field map written at append time.
    pub fields: Arc<HashMap<String, String>>,
    /// How many times this entry has been delivered to some consumer.
    pub delivery_count: u64,
}

/// Snapshot of a consumer group's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Retained stream length (delivered-but-unacked plus undelivered).
    pub length: usize,
    /// Entries currently in the pending entry list.
    pub pending_count: usize,
    /// Distinct consumers the group has seen.
    pub consumers: usize,
}

/// A delivered entry awaiting acknowledgment.
struct PendingEntry {
    consumer: String,
    fields: Arc<HashMap<String, String>>,
    delivery_count: u64,
    first_delivered_at: Instant,
    last_delivered_at: Instant,
}

struct Group {
    /// Next never-delivered entry id.
    cursor: u64,
    pending: BTreeMap<u64, PendingEntry>,
    consumers: HashSet<String>,
}

struct StreamInner {
    /// Retained log, ordered by id.
    entries: VecDeque<(u64, Arc<HashMap<String, String>>)>,
    next_id: u64,
    groups: HashMap<String, Group>,
}

/// In-process append-only stream with consumer groups.
///
/// Thread-safe: share via `Arc<EventStream>`. All operations take `&self`.
pub struct EventStream {
    inner: Mutex<StreamInner>,
    notify: Notify,
    capacity: usize,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStream {
    /// Create a stream with the default retention capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a stream that refuses appends beyond `capacity` retained
    /// entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StreamInner {
                entries: VecDeque::new(),
                next_id: 0,
                groups: HashMap::new(),
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append a record; returns its monotonic id.
    ///
    /// Wakes any reader blocked on an empty stream.
    pub fn append(&self, fields: HashMap<String, String>) -> Result<EntryId> {
        let id = {
            let mut inner = self.inner.lock();
            if inner.entries.len() >= self.capacity {
                return Err(StreamError::Full {
                    capacity: self.capacity,
                });
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push_back((id, Arc::new(fields)));
            id
        };

        metrics::counter!("stream_entries_appended_total").increment(1);
        self.notify.notify_waiters();
        Ok(EntryId(id))
    }

    /// Create a consumer group if it does not exist yet.
    ///
    /// Idempotent: an existing group is left untouched. A new group starts
    /// at the oldest retained entry, so everything still in the log gets
    /// delivered to it.
    pub fn ensure_group(&self, group: &str) {
        let mut inner = self.inner.lock();
        if !inner.groups.contains_key(group) {
            let cursor = inner.entries.front().map(|(id, _)| *id).unwrap_or(inner.next_id);
            inner.groups.insert(
                group.to_string(),
                Group {
                    cursor,
                    pending: BTreeMap::new(),
                    consumers: HashSet::new(),
                },
            );
            tracing::debug!(group, cursor, "consumer group created");
        }
    }

    /// Fetch up to `max_count` never-delivered entries for `consumer`,
    /// blocking up to `block` when the stream has nothing new.
    ///
    /// Returned entries join the group's PEL under `consumer` with a
    /// delivery count of 1. Returns an empty vec on timeout.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Entry>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Arm the notification before checking, so an append between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);

            let batch = self.take_undelivered(group, consumer, max_count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    fn take_undelivered(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<Entry>> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| StreamError::UnknownGroup(group.to_string()))?;

        let start = inner.entries.partition_point(|(id, _)| *id < g.cursor);
        let now = Instant::now();
        let mut batch = Vec::new();

        for (id, fields) in inner.entries.iter().skip(start).take(max_count) {
            g.pending.insert(
                *id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    fields: Arc::clone(fields),
                    delivery_count: 1,
                    first_delivered_at: now,
                    last_delivered_at: now,
                },
            );
            batch.push(Entry {
                id: EntryId(*id),
                fields: Arc::clone(fields),
                delivery_count: 1,
            });
        }

        if let Some(last) = batch.last() {
            g.cursor = last.id.0 + 1;
            g.consumers.insert(consumer.to_string());
            metrics::gauge!("stream_entries_pending").set(g.pending.len() as f64);
        }

        Ok(batch)
    }

    /// Remove the given entries from the group's PEL.
    ///
    /// Ids not currently pending are silently ignored; returns the number
    /// actually removed.
    pub fn acknowledge(&self, group: &str, entry_ids: &[EntryId]) -> Result<usize> {
        let removed = {
            let mut inner = self.inner.lock();
            let g = inner
                .groups
                .get_mut(group)
                .ok_or_else(|| StreamError::UnknownGroup(group.to_string()))?;

            let mut removed = 0usize;
            for id in entry_ids {
                if g.pending.remove(&id.0).is_some() {
                    removed += 1;
                }
            }
            metrics::gauge!("stream_entries_pending").set(g.pending.len() as f64);
            Self::trim(&mut inner);
            removed
        };

        metrics::counter!("stream_entries_acknowledged_total").increment(removed as u64);
        Ok(removed)
    }

    /// Atomically reassign PEL entries idle for at least `min_idle` to
    /// `consumer`, oldest first, up to `max_count`.
    ///
    /// Bumps each entry's delivery count and resets its idle clock.
    pub fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<Entry>> {
        let claimed = {
            let mut inner = self.inner.lock();
            let g = inner
                .groups
                .get_mut(group)
                .ok_or_else(|| StreamError::UnknownGroup(group.to_string()))?;

            let now = Instant::now();
            let mut claimed = Vec::new();

            for (id, pending) in g.pending.iter_mut() {
                if claimed.len() >= max_count {
                    break;
                }
                if now.duration_since(pending.last_delivered_at) < min_idle {
                    continue;
                }
                tracing::debug!(
                    entry_id = *id,
                    from = %pending.consumer,
                    to = consumer,
                    delivery_count = pending.delivery_count + 1,
                    age_ms = now.duration_since(pending.first_delivered_at).as_millis() as u64,
                    "reclaiming stale pending entry"
                );
                pending.consumer = consumer.to_string();
                pending.delivery_count += 1;
                pending.last_delivered_at = now;
                claimed.push(Entry {
                    id: EntryId(*id),
                    fields: Arc::clone(&pending.fields),
                    delivery_count: pending.delivery_count,
                });
            }

            if !claimed.is_empty() {
                g.consumers.insert(consumer.to_string());
            }
            claimed
        };

        metrics::counter!("stream_entries_reclaimed_total").increment(claimed.len() as u64);
        Ok(claimed)
    }

    /// Snapshot the group's state.
    pub fn info(&self, group: &str) -> Result<GroupInfo> {
        let inner = self.inner.lock();
        let g = inner
            .groups
            .get(group)
            .ok_or_else(|| StreamError::UnknownGroup(group.to_string()))?;

        Ok(GroupInfo {
            length: inner.entries.len(),
            pending_count: g.pending.len(),
            consumers: g.consumers.len(),
        })
    }

    /// Drop log entries every group has both passed and acknowledged.
    ///
    /// The low-water mark per group is its cursor or its oldest pending
    /// entry, whichever is older; entries below every group's mark can no
    /// longer be delivered or reclaimed.
    fn trim(inner: &mut StreamInner) {
        let Some(low) = inner
            .groups
            .values()
            .map(|g| {
                g.pending
                    .keys()
                    .next()
                    .copied()
                    .unwrap_or(g.cursor)
                    .min(g.cursor)
            })
            .min()
        else {
            return;
        };

        while let Some((id, _)) = inner.entries.front() {
            if *id < low {
                inner.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: &str = "evp-workers-group";

    fn fields(n: u64) -> HashMap<String, String> {
        HashMap::from([("n".to_string(), n.to_string())])
    }

    fn stream_with_group() -> EventStream {
        let stream = EventStream::new();
        stream.ensure_group(GROUP);
        stream
    }

    // =========================================================================
    // Append / read ordering
    // =========================================================================

    #[test]
    fn test_append_ids_are_monotonic() {
        let stream = stream_with_group();
        let a = stream.append(fields(1)).unwrap();
        let b = stream.append(fields(2)).unwrap();
        let c = stream.append(fields(3)).unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_read_group_is_fifo() {
        let stream = stream_with_group();
        for n in 0..5 {
            stream.append(fields(n)).unwrap();
        }

        let batch = stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let order: Vec<&str> = batch.iter().map(|e| e.fields["n"].as_str()).collect();
        assert_eq!(order, ["0", "1", "2", "3", "4"]);
        assert!(batch.iter().all(|e| e.delivery_count == 1));
    }

    #[tokio::test]
    async fn test_read_group_respects_max_count() {
        let stream = stream_with_group();
        for n in 0..10 {
            stream.append(fields(n)).unwrap();
        }

        let first = stream
            .read_group(GROUP, "c1", 3, Duration::ZERO)
            .await
            .unwrap();
        let second = stream
            .read_group(GROUP, "c1", 100, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 7);
        assert!(first.last().unwrap().id < second.first().unwrap().id);
    }

    #[tokio::test]
    async fn test_entries_deliver_to_exactly_one_consumer() {
        let stream = stream_with_group();
        for n in 0..6 {
            stream.append(fields(n)).unwrap();
        }

        let a = stream
            .read_group(GROUP, "c1", 3, Duration::ZERO)
            .await
            .unwrap();
        let b = stream
            .read_group(GROUP, "c2", 10, Duration::ZERO)
            .await
            .unwrap();

        let ids_a: HashSet<u64> = a.iter().map(|e| e.id.0).collect();
        let ids_b: HashSet<u64> = b.iter().map(|e| e.id.0).collect();
        assert_eq!(ids_a.len(), 3);
        assert_eq!(ids_b.len(), 3);
        assert!(ids_a.is_disjoint(&ids_b));
    }

    // =========================================================================
    // Groups
    // =========================================================================

    #[test]
    fn test_ensure_group_is_idempotent() {
        let stream = stream_with_group();
        stream.append(fields(1)).unwrap();
        stream.ensure_group(GROUP); // second call must not reset anything
        assert_eq!(stream.info(GROUP).unwrap().length, 1);
    }

    #[tokio::test]
    async fn test_ensure_group_does_not_reset_cursor() {
        let stream = stream_with_group();
        stream.append(fields(1)).unwrap();
        let read = stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);

        stream.ensure_group(GROUP);
        let again = stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_group_errors() {
        let stream = EventStream::new();
        let err = stream
            .read_group("nope", "c1", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::UnknownGroup("nope".to_string()));
        assert!(stream.acknowledge("nope", &[]).is_err());
        assert!(stream.claim_idle("nope", "c1", Duration::ZERO, 1).is_err());
        assert!(stream.info("nope").is_err());
    }

    #[tokio::test]
    async fn test_new_group_sees_retained_entries() {
        let stream = EventStream::new();
        stream.ensure_group(GROUP);
        stream.append(fields(1)).unwrap();

        stream.ensure_group("late-group");
        let read = stream
            .read_group("late-group", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    // =========================================================================
    // Blocking reads
    // =========================================================================

    #[tokio::test]
    async fn test_empty_stream_read_times_out() {
        let stream = stream_with_group();
        let started = Instant::now();
        let batch = stream
            .read_group(GROUP, "c1", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(batch.is_empty());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
    }

    #[tokio::test]
    async fn test_blocked_reader_wakes_on_append() {
        let stream = Arc::new(stream_with_group());

        let writer = Arc::clone(&stream);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(fields(42)).unwrap();
        });

        let batch = stream
            .read_group(GROUP, "c1", 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].fields["n"], "42");
    }

    // =========================================================================
    // Acknowledge / PEL
    // =========================================================================

    #[tokio::test]
    async fn test_read_moves_entries_into_pel() {
        let stream = stream_with_group();
        for n in 0..4 {
            stream.append(fields(n)).unwrap();
        }
        stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        let info = stream.info(GROUP).unwrap();
        assert_eq!(info.pending_count, 4);
        assert_eq!(info.consumers, 1);
    }

    #[tokio::test]
    async fn test_acknowledge_counts_only_pending() {
        let stream = stream_with_group();
        for n in 0..3 {
            stream.append(fields(n)).unwrap();
        }
        let batch = stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        let ids: Vec<EntryId> = batch.iter().map(|e| e.id).collect();
        assert_eq!(stream.acknowledge(GROUP, &ids).unwrap(), 3);
        // Second ack of the same ids is a no-op
        assert_eq!(stream.acknowledge(GROUP, &ids).unwrap(), 0);
        // Unknown ids are silently ignored
        assert_eq!(stream.acknowledge(GROUP, &[EntryId(999)]).unwrap(), 0);
        assert_eq!(stream.info(GROUP).unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_acknowledged_entries_are_trimmed() {
        let stream = stream_with_group();
        for n in 0..10 {
            stream.append(fields(n)).unwrap();
        }
        let batch = stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let ids: Vec<EntryId> = batch.iter().map(|e| e.id).collect();
        stream.acknowledge(GROUP, &ids).unwrap();

        assert_eq!(stream.info(GROUP).unwrap().length, 0);
    }

    #[tokio::test]
    async fn test_unacked_entries_are_retained() {
        let stream = stream_with_group();
        for n in 0..4 {
            stream.append(fields(n)).unwrap();
        }
        let batch = stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        // Ack only the middle two; the log keeps everything from the
        // oldest pending entry onward.
        stream
            .acknowledge(GROUP, &[batch[1].id, batch[2].id])
            .unwrap();

        let info = stream.info(GROUP).unwrap();
        assert_eq!(info.pending_count, 2);
        assert_eq!(info.length, 4);
    }

    // =========================================================================
    // Claim-idle
    // =========================================================================

    #[tokio::test]
    async fn test_claim_idle_reassigns_and_bumps_delivery_count() {
        let stream = stream_with_group();
        for n in 0..3 {
            stream.append(fields(n)).unwrap();
        }
        stream
            .read_group(GROUP, "crashed", 10, Duration::ZERO)
            .await
            .unwrap();

        let claimed = stream
            .claim_idle(GROUP, "rescuer", Duration::ZERO, 100)
            .unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|e| e.delivery_count == 2));
        // FIFO by entry id
        assert!(claimed.windows(2).all(|w| w[0].id < w[1].id));

        let info = stream.info(GROUP).unwrap();
        assert_eq!(info.pending_count, 3);
        assert_eq!(info.consumers, 2);
    }

    #[tokio::test]
    async fn test_claim_idle_respects_min_idle() {
        let stream = stream_with_group();
        stream.append(fields(1)).unwrap();
        stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        let claimed = stream
            .claim_idle(GROUP, "c2", Duration::from_secs(60), 100)
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_claim_idle_respects_max_count() {
        let stream = stream_with_group();
        for n in 0..5 {
            stream.append(fields(n)).unwrap();
        }
        stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        let claimed = stream
            .claim_idle(GROUP, "c2", Duration::ZERO, 2)
            .unwrap();
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn test_claimed_entries_not_redelivered_by_read() {
        let stream = stream_with_group();
        stream.append(fields(1)).unwrap();
        stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        stream
            .claim_idle(GROUP, "c2", Duration::ZERO, 100)
            .unwrap();

        // The cursor is already past the entry; only the PEL owns it now.
        let read = stream
            .read_group(GROUP, "c3", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_after_claim_clears_pel() {
        let stream = stream_with_group();
        stream.append(fields(1)).unwrap();
        stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let claimed = stream
            .claim_idle(GROUP, "c2", Duration::ZERO, 100)
            .unwrap();

        let ids: Vec<EntryId> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(stream.acknowledge(GROUP, &ids).unwrap(), 1);
        assert_eq!(stream.info(GROUP).unwrap().pending_count, 0);
        assert_eq!(stream.info(GROUP).unwrap().length, 0);
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    #[test]
    fn test_append_refused_at_capacity() {
        let stream = EventStream::with_capacity(2);
        stream.ensure_group(GROUP);
        stream.append(fields(1)).unwrap();
        stream.append(fields(2)).unwrap();

        let err = stream.append(fields(3)).unwrap_err();
        assert_eq!(err, StreamError::Full { capacity: 2 });
    }

    #[tokio::test]
    async fn test_capacity_frees_after_ack() {
        let stream = EventStream::with_capacity(2);
        stream.ensure_group(GROUP);
        stream.append(fields(1)).unwrap();
        stream.append(fields(2)).unwrap();

        let batch = stream
            .read_group(GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let ids: Vec<EntryId> = batch.iter().map(|e| e.id).collect();
        stream.acknowledge(GROUP, &ids).unwrap();

        assert!(stream.append(fields(3)).is_ok());
    }
}
