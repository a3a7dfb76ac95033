//! Tiered expiry tracking for pooled transactions.
//!
//! Every admitted transaction is also registered here. Each time an entry's
//! current tier elapses it is reported for re-broadcast and moved to the next
//! tier; when the final tier elapses the entry is reported once more with
//! `is_last` set so the caller can evict it from the pool.
//!
//! The queue is a passive data structure; the node drives it from a periodic
//! timer and handles the reported entries.

use pofcore_types::Hash256;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default re-broadcast tiers: 1 minute, 10 minutes, 1 hour.
pub const DEFAULT_TIERS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(600),
    Duration::from_secs(3_600),
];

/// An entry whose current tier elapsed.
#[derive(Debug, Clone)]
pub struct Expired<V> {
    /// The entry key (canonical transaction hash)
    pub key: Hash256,
    /// The tracked value (the original gossip message)
    pub value: V,
    /// The tier index that elapsed (0-based)
    pub tier: usize,
    /// Whether this was the final tier; the entry is gone afterwards
    pub is_last: bool,
}

struct Entry<V> {
    value: V,
    tier: usize,
    deadline: Instant,
}

/// Multi-tier expire queue keyed by transaction hash.
pub struct ExpireQueue<V> {
    tiers: Vec<Duration>,
    entries: HashMap<Hash256, Entry<V>>,
}

impl<V: Clone> ExpireQueue<V> {
    /// Creates a queue with the given tier durations.
    ///
    /// # Panics
    ///
    /// Panics if `tiers` is empty.
    pub fn new(tiers: &[Duration]) -> Self {
        assert!(!tiers.is_empty(), "expire queue needs at least one tier");
        Self {
            tiers: tiers.to_vec(),
            entries: HashMap::new(),
        }
    }

    /// Creates a queue with [`DEFAULT_TIERS`].
    pub fn with_default_tiers() -> Self {
        Self::new(&DEFAULT_TIERS)
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Starts tracking a key at tier 0. Re-pushing resets the entry.
    pub fn push(&mut self, key: Hash256, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                tier: 0,
                deadline: Instant::now() + self.tiers[0],
            },
        );
    }

    /// Stops tracking a key (a transaction made it into a block).
    pub fn remove(&mut self, key: &Hash256) {
        self.entries.remove(key);
    }

    /// Collects entries whose tier elapsed at `now`, advancing or evicting
    /// each one.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<Expired<V>> {
        let mut out = Vec::new();
        let last_tier = self.tiers.len() - 1;

        let due: Vec<Hash256> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(k, _)| *k)
            .collect();

        for key in due {
            let entry = self.entries.get_mut(&key).expect("key collected above");
            let tier = entry.tier;
            if tier >= last_tier {
                let entry = self.entries.remove(&key).expect("key collected above");
                out.push(Expired {
                    key,
                    value: entry.value,
                    tier,
                    is_last: true,
                });
            } else {
                entry.tier += 1;
                entry.deadline = now + self.tiers[entry.tier];
                out.push(Expired {
                    key,
                    value: entry.value.clone(),
                    tier,
                    is_last: false,
                });
            }
        }
        out
    }
}
