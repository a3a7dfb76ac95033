//! # PoF Core Transaction Pool
//!
//! Bounded transaction pool for the PoF Core block production engine.
//!
//! The pool:
//! - Caps at 65,535 pending transactions
//! - Deduplicates by canonical transaction hash
//! - Releases transactions oldest-first, gated on the sender's next sequence
//!   number under a live staging context
//! - Freezes entirely around a block build via an RAII [`pool::LockedPool`]
//! - Tracks each entry through a three-tier expire queue for periodic
//!   re-broadcast and final eviction
//!
//! ## Example
//!
//! ```rust,ignore
//! use pofcore_txpool::TransactionPool;
//!
//! let pool = TransactionPool::new();
//! pool.push(tx_type, tx_hash, tx, sigs, signers)?;
//!
//! let mut locked = pool.lock();
//! while let Some(item) = locked.unsafe_pop(ctx) {
//!     // feed item into the block creator
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod expire;
pub mod pool;

pub use expire::{ExpireQueue, Expired};
pub use pool::{LockedPool, PoolItem, TransactionPool, MAX_POOL_SIZE};

use pofcore_chain::Context;
use pofcore_types::{PublicHash, Transaction};

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur during transaction admission
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is at capacity
    #[error("transaction pool overflowed")]
    TransactionPoolOverflowed,

    /// The transaction hash is already pooled
    #[error("exist transaction")]
    ExistTransaction,

    /// The sequence number is at or below the account's current one
    #[error("past seq")]
    PastSeq,

    /// The sequence number is more than 100 ahead of the account's current one
    #[error("too far seq")]
    TooFarSeq,

    /// A referenced UTXO is unknown or spent
    #[error("invalid UTXO")]
    InvalidUtxo,

    /// The sequence is malformed for the transaction type
    #[error("invalid sequence")]
    InvalidSequence,

    /// A signer signature did not recover to a usable key
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Process-specific validation rejected the transaction
    #[error("validation failed: {0}")]
    Validation(String),
}

impl PoolError {
    /// Whether the error is swallowed at the peer boundary.
    ///
    /// These admission failures are expected under normal gossip (duplicate
    /// delivery, raced sequences) and must not cost the delivering peer its
    /// connection.
    pub fn is_swallowed(&self) -> bool {
        matches!(
            self,
            PoolError::InvalidUtxo
                | PoolError::ExistTransaction
                | PoolError::TooFarSeq
                | PoolError::PastSeq
        )
    }
}

/// Process-specific transaction validation hook.
///
/// Invoked during admission after signer recovery, with the staging context
/// the transaction would execute under.
pub trait TransactionValidator: Send + Sync {
    /// Validates `tx` for admission. Returning an error rejects it.
    fn validate(
        &self,
        tx: &Transaction,
        ctx: &dyn Context,
        signers: &[PublicHash],
    ) -> Result<()>;
}

/// Validator that admits every structurally sound transaction.
///
/// Used by tests and the demo binary; production embedders plug in their
/// process-specific rules.
pub struct AcceptAllValidator;

impl TransactionValidator for AcceptAllValidator {
    fn validate(
        &self,
        _tx: &Transaction,
        _ctx: &dyn Context,
        _signers: &[PublicHash],
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swallow_set() {
        assert!(PoolError::InvalidUtxo.is_swallowed());
        assert!(PoolError::ExistTransaction.is_swallowed());
        assert!(PoolError::TooFarSeq.is_swallowed());
        assert!(PoolError::PastSeq.is_swallowed());
        assert!(!PoolError::TransactionPoolOverflowed.is_swallowed());
        assert!(!PoolError::InvalidSignature("bad".into()).is_swallowed());
    }
}
