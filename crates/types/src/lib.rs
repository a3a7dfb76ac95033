//! # PoF Core Types
//!
//! Core type definitions for the PoF Core block production engine.
//!
//! This crate provides the fundamental types used throughout PoF Core:
//! - [`Hash256`] - 32-byte content identifiers with Keccak256 support
//! - [`Address`] - 20-byte account identifiers
//! - [`PublicHash`] - 32-byte peer identities derived from public keys
//! - [`Signature`] - 65-byte recoverable ECDSA signatures
//! - [`Header`], [`Block`], [`BlockSign`] - block structures
//! - [`Transaction`] - account-sequence transactions
//!
//! ## Example
//!
//! ```rust
//! use pofcore_types::{Address, Hash256};
//!
//! let hash = Hash256::keccak256(b"hello world");
//! assert_ne!(hash, Hash256::NIL);
//!
//! let addr: Address = "0x742d35cc6634c0532925a3b844bc9e7595f0beb1".parse().unwrap();
//! assert!(!addr.is_zero());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod address;
pub mod block;
pub mod hash;
pub mod transaction;
pub mod util;

pub use address::{Address, PublicHash, ADDRESS_SIZE, PUBLIC_HASH_SIZE};
pub use block::{Block, BlockSign, Header};
pub use hash::{Hash256, HASH_SIZE};
pub use transaction::{Signature, Transaction, SIGNATURE_SIZE};
pub use util::{marshal_id, parse_transaction_id, transaction_id, unmarshal_id};

/// Result type alias for PoF Core type operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with PoF Core types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Byte slice has the wrong length
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected number of bytes
        expected: usize,
        /// Actual number of bytes
        actual: usize,
    },

    /// Malformed hash string
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    /// Malformed address string
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Block shape invariant violated
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// Transaction id string is not parseable
    #[error("invalid transaction id format")]
    InvalidTransactionIdFormat,
}
