//! Block and header types.
//!
//! This module provides the block-related types:
//! - [`Header`] - block metadata; its hash is the block identifier
//! - [`Block`] - a complete block with transactions and signatures
//! - [`BlockSign`] - the observer cohort's signed view of a header

use crate::{Address, Error, Hash256, Result, Signature, Transaction};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A block header.
///
/// The keccak256 hash of the canonical header encoding identifies the block.
/// `consensus_data` carries the round's timeout count as little-endian bytes;
/// the core treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Chain identifier (prevents cross-chain replay)
    pub chain_id: u8,
    /// Header format version
    pub version: u16,
    /// Block height (genesis is height 0)
    pub height: u32,
    /// Hash of the previous block's header
    pub prev_hash: Hash256,
    /// Commitment to the staged ledger state after this block
    pub context_hash: Hash256,
    /// Block timestamp in nanoseconds, strictly greater than the parent's
    pub timestamp: u64,
    /// Address of the formulator that generated this block
    pub generator: Address,
    /// Consensus byte payload (timeout count)
    pub consensus_data: Bytes,
}

impl Header {
    /// Canonical byte encoding used for hashing.
    ///
    /// Fixed-width fields in declaration order, then consensus data verbatim.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 2 + 4 + 32 + 32 + 8 + 20 + self.consensus_data.len());
        out.push(self.chain_id);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(self.prev_hash.as_bytes());
        out.extend_from_slice(self.context_hash.as_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.generator.as_bytes());
        out.extend_from_slice(&self.consensus_data);
        out
    }

    /// Computes the hash of this header, which identifies the block.
    pub fn hash(&self) -> Hash256 {
        Hash256::keccak256(&self.encode())
    }

    /// Validates the header against basic structural rules.
    pub fn validate_basic(&self) -> Result<()> {
        if self.height > 0 && self.prev_hash.is_nil() {
            return Err(Error::InvalidBlock(
                "non-genesis block must have a previous hash".into(),
            ));
        }
        if self.height > 0 && self.timestamp == 0 {
            return Err(Error::InvalidBlock(
                "non-genesis block must have a timestamp".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block #{} (hash: {}, prev: {}, generator: {})",
            self.height,
            self.hash(),
            self.prev_hash,
            self.generator
        )
    }
}

/// A complete block.
///
/// Shape invariant: `transactions`, `transaction_types` and
/// `transaction_signatures` have equal length. `signatures[0]` is the
/// formulator's header signature; `signatures[1..]` are the observer
/// signatures in the order they were aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The block header
    pub header: Header,
    /// Per-transaction type ids, parallel to `transactions`
    pub transaction_types: Vec<u16>,
    /// The transactions in this block
    pub transactions: Vec<Transaction>,
    /// Per-transaction signer signatures, parallel to `transactions`
    pub transaction_signatures: Vec<Vec<Signature>>,
    /// Per-transaction execution results, parallel to `transactions`
    pub transaction_results: Vec<u8>,
    /// Header signatures: generator first, then observers
    pub signatures: Vec<Signature>,
}

impl Block {
    /// Creates an empty block with the given header.
    pub fn empty(header: Header) -> Self {
        Self {
            header,
            transaction_types: Vec::new(),
            transactions: Vec::new(),
            transaction_signatures: Vec::new(),
            transaction_results: Vec::new(),
            signatures: Vec::new(),
        }
    }

    /// Returns the block hash (hash of the header).
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Returns the block height.
    pub fn height(&self) -> u32 {
        self.header.height
    }

    /// Returns the number of transactions in the block.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Validates the parallel-list shape invariant.
    pub fn validate_shape(&self) -> Result<()> {
        let n = self.transactions.len();
        if self.transaction_types.len() != n || self.transaction_signatures.len() != n {
            return Err(Error::InvalidBlock(format!(
                "parallel transaction lists disagree: {} types, {} txs, {} signature sets",
                self.transaction_types.len(),
                n,
                self.transaction_signatures.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block #{} (hash: {}, {} txs)",
            self.header.height,
            self.hash(),
            self.transactions.len()
        )
    }
}

/// The observer cohort's signed view of a block header.
///
/// Returned inside the aggregated observer-signature message; the formulator
/// checks `header_hash` against its own emitted header before committing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSign {
    /// Hash of the header being co-signed
    pub header_hash: Hash256,
    /// The formulator's signature the observers countersigned
    pub generator_signature: Signature,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(height: u32) -> Header {
        Header {
            chain_id: 1,
            version: 1,
            height,
            prev_hash: Hash256::keccak256(b"prev"),
            context_hash: Hash256::keccak256(b"ctx"),
            timestamp: 1_700_000_000_000_000_000,
            generator: Address::new([7u8; 20]),
            consensus_data: Bytes::from_static(&[0, 0, 0, 0]),
        }
    }

    #[test]
    fn test_header_hash_is_stable() {
        let h = sample_header(5);
        assert_eq!(h.hash(), h.hash());
    }

    #[test]
    fn test_header_hash_changes_with_height() {
        assert_ne!(sample_header(5).hash(), sample_header(6).hash());
    }

    #[test]
    fn test_header_validate_basic() {
        let mut h = sample_header(5);
        assert!(h.validate_basic().is_ok());
        h.prev_hash = Hash256::NIL;
        assert!(h.validate_basic().is_err());
    }

    #[test]
    fn test_block_shape_invariant() {
        let mut b = Block::empty(sample_header(1));
        assert!(b.validate_shape().is_ok());

        b.transaction_types.push(0);
        assert!(b.validate_shape().is_err());
    }

    #[test]
    fn test_block_hash_is_header_hash() {
        let b = Block::empty(sample_header(3));
        assert_eq!(b.hash(), b.header.hash());
    }
}
