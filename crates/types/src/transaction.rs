//! Transaction and signature types.
//!
//! This module provides:
//! - [`Signature`] - a 65-byte recoverable ECDSA signature (r|s|v)
//! - [`Transaction`] - an account-sequence transaction

use crate::{Address, Error, Hash256, Result};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Size of a recoverable signature in bytes (r: 32, s: 32, v: 1)
pub const SIGNATURE_SIZE: usize = 65;

/// A 65-byte recoverable ECDSA signature.
///
/// The layout is `r (32)|s (32)|v (1)`. The recovery byte allows the
/// signer's public key to be recovered from the signed hash, which is how
/// both transaction signers and handshake peers are identified.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    /// Creates a signature from a 65-byte array.
    #[inline]
    pub const fn new(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a signature from a slice.
    ///
    /// Returns an error if the slice length is not exactly 65 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(Error::InvalidLength {
                expected: SIGNATURE_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Returns the signature as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the signature as a fixed-size byte array.
    #[inline]
    pub const fn as_fixed_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Returns the hex representation with 0x prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Creates a signature from its hex representation.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; SIGNATURE_SIZE])
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{}…)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl From<[u8; SIGNATURE_SIZE]> for Signature {
    fn from(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
            Self::from_slice(&bytes).map_err(serde::de::Error::custom)
        }
    }
}

/// An account-sequence transaction.
///
/// Every transaction carries the sender's next sequence number; the pool only
/// admits transactions inside the `(seq, seq + 100]` window of the sender's
/// current sequence and only releases a transaction for inclusion once its
/// sequence is exactly the next one. The `payload` bytes are opaque to the
/// block production core and interpreted by the process-specific validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Submission time in nanoseconds, used for pool ordering
    pub timestamp: u64,
    /// Sender account
    pub from: Address,
    /// Recipient account
    pub to: Address,
    /// Sender's sequence number for this transaction (1-based, strictly
    /// increasing per account)
    pub seq: u64,
    /// Transferred amount in minimum units
    pub amount: u128,
    /// Process-specific payload bytes
    pub payload: Bytes,
}

impl Transaction {
    /// Creates a transfer transaction with an empty payload.
    pub fn transfer(from: Address, to: Address, seq: u64, amount: u128, timestamp: u64) -> Self {
        Self {
            timestamp,
            from,
            to,
            seq,
            amount,
            payload: Bytes::new(),
        }
    }

    /// Canonical byte encoding used for hashing.
    ///
    /// Fixed-width fields in declaration order, then the payload verbatim.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 20 + 20 + 8 + 16 + self.payload.len());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.from.as_bytes());
        out.extend_from_slice(self.to.as_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Hash of the canonical encoding alone, without chain or type binding.
    ///
    /// Pool admission and wire traffic use the chain-bound hash instead; see
    /// `hash_transaction_by_type` in the chain crate.
    pub fn content_hash(&self) -> Hash256 {
        Hash256::keccak256(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction::transfer(
            Address::new([1u8; 20]),
            Address::new([2u8; 20]),
            7,
            1_000,
            42,
        )
    }

    #[test]
    fn test_signature_roundtrip() {
        let sig = Signature::new([0xab; 65]);
        let parsed = Signature::from_hex(&sig.to_hex()).unwrap();
        assert_eq!(sig, parsed);
    }

    #[test]
    fn test_signature_invalid_length() {
        assert!(Signature::from_slice(&[0u8; 64]).is_err());
        assert!(Signature::from_slice(&[0u8; 66]).is_err());
    }

    #[test]
    fn test_transaction_encode_is_stable() {
        let tx = sample_tx();
        assert_eq!(tx.encode(), tx.encode());
        assert_eq!(tx.content_hash(), tx.content_hash());
    }

    #[test]
    fn test_transaction_hash_differs_by_seq() {
        let mut a = sample_tx();
        let b = sample_tx();
        a.seq += 1;
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_transaction_serde_bincode() {
        let tx = sample_tx();
        let bytes = bincode::serialize(&tx).unwrap();
        let decoded: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(tx, decoded);
    }
}
