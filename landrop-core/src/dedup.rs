//! Bounded, time-windowed dedup cache.
//!
//! The wire carries no transport-level dedup (plain UDP, ACKs are
//! best-effort), so a retransmitted CHUNK, TALK, or END must not be
//! reprocessed twice by the receiver. The receiver remembers ids it has
//! already handled and drops repeats after re-sending the ACK. Nothing on
//! the wire ever expires an id itself, so a process that ran forever with an
//! unbounded "ever seen" set would grow without limit; evicting entries once
//! they are older than any sender could still legitimately be retrying
//! resolves that.
//!
//! A retransmit of a given id can only occur within the sender's own
//! stop-and-wait window: at most [`MAX_ATTEMPTS`](crate::ack::MAX_ATTEMPTS)
//! sends, [`ACK_WAIT`](crate::ack::ACK_WAIT) apart. `DEDUP_WINDOW` doubles
//! that span for margin and is the only eviction signal this cache needs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::ack::{ACK_WAIT, MAX_ATTEMPTS};

/// How long an id is remembered after first being seen.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(2 * ACK_WAIT.as_secs() * MAX_ATTEMPTS as u64);

/// Seen-id cache with lazy eviction: old entries are swept out on `insert`
/// rather than on a separate timer, so the cache never needs its own
/// background task.
#[derive(Default)]
pub struct DedupCache {
    inner: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Record `id` as seen and report whether it was already present (i.e.
    /// this delivery is a duplicate). A duplicate's timestamp is refreshed so
    /// a hot retransmit storm doesn't expire mid-stream.
    pub async fn seen(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut table = self.inner.lock().await;
        table.retain(|_, seen_at| now.duration_since(*seen_at) < DEDUP_WINDOW);
        let was_present = table.contains_key(id);
        table.insert(id.to_string(), now);
        was_present
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_is_not_a_duplicate() {
        let cache = DedupCache::new();
        assert!(!cache.seen("1").await);
    }

    #[tokio::test]
    async fn second_sighting_is_a_duplicate() {
        let cache = DedupCache::new();
        assert!(!cache.seen("1").await);
        assert!(cache.seen("1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_dedup_window() {
        let cache = DedupCache::new();
        assert!(!cache.seen("1").await);
        tokio::time::advance(DEDUP_WINDOW + Duration::from_secs(1)).await;
        assert!(!cache.seen("1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_sightings_refresh_expiry() {
        let cache = DedupCache::new();
        assert!(!cache.seen("1").await);
        tokio::time::advance(DEDUP_WINDOW - Duration::from_secs(1)).await;
        assert!(cache.seen("1").await);
        tokio::time::advance(DEDUP_WINDOW - Duration::from_secs(1)).await;
        assert!(cache.seen("1").await);
    }
}
