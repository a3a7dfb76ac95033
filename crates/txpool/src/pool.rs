//! The transaction pool proper.
//!
//! Entries are keyed by canonical transaction hash and released oldest-first
//! once their sequence number becomes the sender's next one under the caller's
//! staging context. The pool itself never checks admission windows; callers
//! gate on `ctx.seq` before pushing.

use crate::{PoolError, Result};
use parking_lot::{Mutex, MutexGuard};
use pofcore_chain::Context;
use pofcore_types::{Hash256, PublicHash, Signature, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tracing::trace;

/// Hard cap on pooled transactions.
pub const MAX_POOL_SIZE: usize = 65_535;

/// A pooled transaction with its admission metadata.
#[derive(Debug, Clone)]
pub struct PoolItem {
    /// Transaction type id
    pub tx_type: u16,
    /// Canonical transaction hash (chain- and type-bound)
    pub tx_hash: Hash256,
    /// The transaction itself
    pub transaction: Transaction,
    /// Submitter signatures
    pub signatures: Vec<Signature>,
    /// Signer identities recovered from the signatures
    pub signers: Vec<PublicHash>,
    /// When the entry was admitted
    pub inserted_at: Instant,
}

/// Ordering key for the release index: oldest submission first, hash as the
/// deterministic tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    timestamp: u64,
    hash: Hash256,
}

#[derive(Default)]
struct PoolInner {
    by_hash: HashMap<Hash256, PoolItem>,
    by_priority: BTreeSet<PriorityKey>,
}

impl PoolInner {
    fn insert(&mut self, item: PoolItem) {
        self.by_priority.insert(PriorityKey {
            timestamp: item.transaction.timestamp,
            hash: item.tx_hash,
        });
        self.by_hash.insert(item.tx_hash, item);
    }

    fn remove(&mut self, hash: &Hash256) -> Option<PoolItem> {
        let item = self.by_hash.remove(hash)?;
        self.by_priority.remove(&PriorityKey {
            timestamp: item.transaction.timestamp,
            hash: item.tx_hash,
        });
        Some(item)
    }
}

/// Bounded transaction pool.
///
/// All operations lock internally; [`TransactionPool::lock`] additionally
/// freezes the pool for the duration of a block build so concurrent pushes
/// cannot race the drain.
#[derive(Default)]
pub struct TransactionPool {
    inner: Mutex<PoolInner>,
}

impl TransactionPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pooled transactions.
    pub fn size(&self) -> usize {
        self.inner.lock().by_hash.len()
    }

    /// Whether a transaction hash is pooled.
    pub fn is_exist(&self, hash: &Hash256) -> bool {
        self.inner.lock().by_hash.contains_key(hash)
    }

    /// Admits a transaction.
    ///
    /// Fails with [`PoolError::TransactionPoolOverflowed`] at capacity and
    /// [`PoolError::ExistTransaction`] on duplicate hashes.
    pub fn push(
        &self,
        tx_type: u16,
        tx_hash: Hash256,
        transaction: Transaction,
        signatures: Vec<Signature>,
        signers: Vec<PublicHash>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.by_hash.len() >= MAX_POOL_SIZE {
            return Err(PoolError::TransactionPoolOverflowed);
        }
        if inner.by_hash.contains_key(&tx_hash) {
            return Err(PoolError::ExistTransaction);
        }
        inner.insert(PoolItem {
            tx_type,
            tx_hash,
            transaction,
            signatures,
            signers,
            inserted_at: Instant::now(),
        });
        trace!(hash = %tx_hash, pooled = inner.by_hash.len(), "transaction pooled");
        Ok(())
    }

    /// Removes a transaction by hash. Idempotent.
    pub fn remove(&self, hash: &Hash256) {
        let mut inner = self.inner.lock();
        if inner.remove(hash).is_some() {
            trace!(hash = %hash, "transaction removed from pool");
        }
    }

    /// Freezes the pool and returns a guard exposing the drain operations.
    pub fn lock(&self) -> LockedPool<'_> {
        LockedPool {
            inner: self.inner.lock(),
        }
    }
}

/// RAII view of a frozen pool, held across a block's build phase.
pub struct LockedPool<'a> {
    inner: MutexGuard<'a, PoolInner>,
}

impl LockedPool<'_> {
    /// Pops the oldest transaction whose sequence number is exactly the
    /// sender's next one under `ctx`.
    ///
    /// Entries that are not yet ready are left in place. The popped entry is
    /// removed; callers that fail to apply it simply drop it.
    pub fn unsafe_pop(&mut self, ctx: &dyn Context) -> Option<PoolItem> {
        let ready = self.inner.by_priority.iter().copied().find(|key| {
            match self.inner.by_hash.get(&key.hash) {
                Some(item) => item.transaction.seq == ctx.seq(&item.transaction.from) + 1,
                None => false,
            }
        })?;
        self.inner.remove(&ready.hash)
    }

    /// Number of pooled transactions under the frozen view.
    pub fn size(&self) -> usize {
        self.inner.by_hash.len()
    }
}
