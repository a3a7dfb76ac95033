//! # PoF Core Chain
//!
//! Ledger state collaborator seam for the PoF Core block production engine.
//!
//! The block production core does not own ledger state. It consumes it
//! through the traits in this crate, allowing different ledger
//! implementations (persistent stores, test fixtures) to be used
//! interchangeably:
//!
//! - [`Provider`] - read access to the committed chain (tip, hashes, blocks)
//! - [`Committer`] - context creation and block connection
//! - [`Context`] - an ephemeral staging layer with snapshot/revert/commit
//! - [`BlockCreator`] - transaction-by-transaction block assembly
//! - [`FormulatorRank`] - the formulator ranking table for request validation
//!
//! [`MemChain`] is the bundled in-memory implementation used by tests and the
//! demo binary.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod memchain;
pub mod traits;

pub use memchain::{MemChain, MemRank};
pub use traits::{BlockCreator, Chain, Committer, Context, FormulatorRank, Provider};

use pofcore_types::{Hash256, Transaction};

/// Result type alias for chain operations
pub type Result<T> = std::result::Result<T, ChainError>;

/// Errors that can occur when reading or extending the chain
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// A block at a known height arrived with a different header hash
    #[error("found forked block")]
    FoundForkedBlock,

    /// Header chain id does not match ours
    #[error("invalid chain id")]
    InvalidChainId,

    /// Header does not link to the current tip
    #[error("invalid previous hash")]
    InvalidPrevHash,

    /// Header height is not the next height
    #[error("invalid height: expected {expected}, got {actual}")]
    InvalidHeight {
        /// The height the chain would accept next
        expected: u32,
        /// The height the header carries
        actual: u32,
    },

    /// Header timestamp does not advance the chain clock
    #[error("invalid timestamp")]
    InvalidTimestamp,

    /// The requested block height is not stored
    #[error("block not found at height {0}")]
    NotFound(u32),

    /// A transaction in the block failed to execute
    #[error("invalid sequence for account")]
    InvalidSequence,

    /// Block shape or content failed validation
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// No formulator is ranked at the requested offset
    #[error("no formulator at rank {0}")]
    NoRankedFormulator(u32),

    /// The chain is shut down
    #[error("chain closed")]
    Closed,
}

/// Computes the canonical pool/wire hash of a transaction.
///
/// The digest binds the chain id and the transaction type id to the
/// transaction body, so the same body gossiped on another chain or under
/// another type registers as a different transaction.
pub fn hash_transaction_by_type(chain_id: u8, tx_type: u16, tx: &Transaction) -> Hash256 {
    Hash256::keccak256_concat(&[&[chain_id], &tx_type.to_le_bytes(), &tx.encode()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pofcore_types::Address;

    #[test]
    fn test_tx_hash_binds_chain_and_type() {
        let tx = Transaction::transfer(
            Address::new([1u8; 20]),
            Address::new([2u8; 20]),
            1,
            10,
            99,
        );
        let base = hash_transaction_by_type(1, 0, &tx);
        assert_ne!(base, hash_transaction_by_type(2, 0, &tx));
        assert_ne!(base, hash_transaction_by_type(1, 1, &tx));
        assert_eq!(base, hash_transaction_by_type(1, 0, &tx));
    }
}
