//! Event-id deduplication with a TTL window.
//!
//! The [`DedupIndex`] answers one question on the ingest fast path: has
//! this `event_id` been accepted within the dedup window? Claims are
//! atomic set-if-absent with the TTL applied as part of the same insert,
//! so there is no window where an id is claimed but never expires.
//!
//! The window is 600 seconds; producers retrying a failed request inside
//! it get a duplicate answer instead of a second record downstream.

use std::time::Duration;

use moka::sync::Cache;

/// TTL of a dedup claim.
pub const DEDUP_TTL: Duration = Duration::from_secs(600);

/// Result of claiming an event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First claim inside the window; the caller may admit the event.
    New,
    /// Already claimed inside the window.
    Duplicate,
}

/// Outcome of a batch claim.
#[derive(Debug, Clone, Default)]
pub struct BatchClaim {
    /// Ids that were new, in submission order.
    pub new_ids: Vec<String>,
    /// How many ids were already claimed (including repeats within the
    /// batch itself).
    pub duplicates: usize,
}

/// TTL-windowed set-if-absent index over event ids.
///
/// Thread-safe: share via `Arc<DedupIndex>` (the underlying cache is
/// internally synchronized).
pub struct DedupIndex {
    cache: Cache<String, ()>,
}

impl Default for DedupIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupIndex {
    /// Create an index with the standard 600 s window.
    pub fn new() -> Self {
        Self::with_ttl(DEDUP_TTL)
    }

    /// Create an index with a custom window (tests mostly).
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Atomically claim `event_id`.
    ///
    /// The first caller inside the window observes [`Claim::New`]; every
    /// other caller observes [`Claim::Duplicate`] until the claim expires.
    pub fn try_claim(&self, event_id: &str) -> Claim {
        let entry = self.cache.entry_by_ref(event_id).or_insert(());

        metrics::counter!("dedup_claims_total").increment(1);
        if entry.is_fresh() {
            Claim::New
        } else {
            metrics::counter!("dedup_duplicates_total").increment(1);
            Claim::Duplicate
        }
    }

    /// Claim a batch of ids in one pass.
    ///
    /// Equivalent to N [`try_claim`](Self::try_claim) calls: an id repeated
    /// within the batch counts as a duplicate after its first claim.
    pub fn try_claim_batch<I, S>(&self, event_ids: I) -> BatchClaim
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut result = BatchClaim::default();
        for id in event_ids {
            match self.try_claim(id.as_ref()) {
                Claim::New => result.new_ids.push(id.as_ref().to_string()),
                Claim::Duplicate => result.duplicates += 1,
            }
        }
        result
    }

    /// Drop a claim before its TTL expires.
    ///
    /// Used by tests and by the ingest service to release ids whose append
    /// failed, so a client retry is not falsely reported as a duplicate.
    pub fn clear(&self, event_id: &str) {
        self.cache.invalidate(event_id);
    }

    /// Approximate number of live claims.
    pub fn approximate_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_claim_is_new_then_duplicate() {
        let index = DedupIndex::new();
        assert_eq!(index.try_claim("evt_a"), Claim::New);
        assert_eq!(index.try_claim("evt_a"), Claim::Duplicate);
        assert_eq!(index.try_claim("evt_a"), Claim::Duplicate);
        assert_eq!(index.try_claim("evt_b"), Claim::New);
    }

    #[test]
    fn test_claim_expires_after_ttl() {
        let index = DedupIndex::with_ttl(Duration::from_millis(50));
        assert_eq!(index.try_claim("evt_a"), Claim::New);
        assert_eq!(index.try_claim("evt_a"), Claim::Duplicate);

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(index.try_claim("evt_a"), Claim::New);
    }

    #[test]
    fn test_clear_releases_claim() {
        let index = DedupIndex::new();
        assert_eq!(index.try_claim("evt_a"), Claim::New);
        index.clear("evt_a");
        assert_eq!(index.try_claim("evt_a"), Claim::New);
    }

    #[test]
    fn test_batch_claim_mixed() {
        let index = DedupIndex::new();
        index.try_claim("evt_seen");

        let batch = index.try_claim_batch(["evt_1", "evt_seen", "evt_2"]);
        assert_eq!(batch.new_ids, vec!["evt_1", "evt_2"]);
        assert_eq!(batch.duplicates, 1);
    }

    #[test]
    fn test_batch_claim_repeats_within_batch() {
        let index = DedupIndex::new();
        let batch = index.try_claim_batch(["evt_x", "evt_x", "evt_x"]);
        assert_eq!(batch.new_ids, vec!["evt_x"]);
        assert_eq!(batch.duplicates, 2);
    }

    #[test]
    fn test_concurrent_claims_admit_exactly_one() {
        use std::sync::Arc;

        let index = Arc::new(DedupIndex::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                (0..100)
                    .filter(|n| index.try_claim(&format!("evt_{n}")) == Claim::New)
                    .count()
            }));
        }

        let total_new: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 8 threads raced over 100 ids; each id admits exactly one claimant
        assert_eq!(total_new, 100);
    }
}
