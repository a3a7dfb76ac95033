//! In-flight block-request tracking.
//!
//! When the node asks a peer for a height it records the request here with a
//! deadline. Expired entries are reported over a channel so the requester can
//! re-target another peer; entries for a disconnecting peer are dropped in
//! bulk via [`RequestTimer::removes_by_value`].

use parking_lot::Mutex;
use pofcore_types::PublicHash;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::trace;

/// Sweep cadence of the expiry loop.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct Entry {
    deadline: Instant,
    value: PublicHash,
}

/// Height-keyed request tracker with per-entry deadlines.
#[derive(Default)]
pub struct RequestTimer {
    entries: Mutex<HashMap<u32, Entry>>,
}

impl RequestTimer {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a request for `height` sent to `value`, expiring after `ttl`.
    pub fn add(&self, height: u32, ttl: Duration, value: PublicHash) {
        self.entries.lock().insert(
            height,
            Entry {
                deadline: Instant::now() + ttl,
                value,
            },
        );
    }

    /// Whether a request for `height` is in flight.
    pub fn exist(&self, height: u32) -> bool {
        self.entries.lock().contains_key(&height)
    }

    /// Stops tracking a height (the block arrived).
    pub fn remove(&self, height: u32) {
        self.entries.lock().remove(&height);
    }

    /// Drops every entry targeting `value` (the peer disconnected).
    pub fn removes_by_value(&self, value: &PublicHash) {
        self.entries.lock().retain(|_, e| e.value != *value);
    }

    /// Number of tracked requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Collects entries whose deadline passed, removing them.
    pub fn pop_expired(&self, now: Instant) -> Vec<(u32, PublicHash)> {
        let mut entries = self.entries.lock();
        let expired: Vec<(u32, PublicHash)> = entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(h, e)| (*h, e.value))
            .collect();
        for (height, _) in &expired {
            entries.remove(height);
        }
        expired
    }

    /// Runs the expiry loop, reporting expired entries over `expired_tx`.
    ///
    /// Returns when the receiving side is dropped.
    pub async fn run(self: Arc<Self>, expired_tx: mpsc::UnboundedSender<(u32, PublicHash)>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            for (height, value) in self.pop_expired(Instant::now()) {
                trace!(height, peer = %value, "request expired");
                if expired_tx.send((height, value)).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pofcore_types::Hash256;

    fn peer(n: u8) -> PublicHash {
        PublicHash::from(Hash256::keccak256(&[n]))
    }

    #[test]
    fn test_add_exist_remove() {
        let timer = RequestTimer::new();
        timer.add(11, Duration::from_secs(2), peer(1));
        assert!(timer.exist(11));
        assert!(!timer.exist(12));

        timer.remove(11);
        assert!(!timer.exist(11));
    }

    #[test]
    fn test_removes_by_value() {
        let timer = RequestTimer::new();
        timer.add(1, Duration::from_secs(2), peer(1));
        timer.add(2, Duration::from_secs(2), peer(2));
        timer.add(3, Duration::from_secs(2), peer(1));

        timer.removes_by_value(&peer(1));
        assert!(!timer.exist(1));
        assert!(timer.exist(2));
        assert!(!timer.exist(3));
    }

    #[test]
    fn test_pop_expired() {
        let timer = RequestTimer::new();
        timer.add(7, Duration::from_millis(10), peer(1));
        timer.add(8, Duration::from_secs(60), peer(2));

        let expired = timer.pop_expired(Instant::now() + Duration::from_millis(20));
        assert_eq!(expired, vec![(7, peer(1))]);
        assert!(!timer.exist(7));
        assert!(timer.exist(8));
    }
}
