//! # PoF Core Crypto
//!
//! Cryptographic primitives for the PoF Core block production engine.
//!
//! This crate provides:
//! - **Keccak256 hashing** - content identifiers and challenge digests
//! - **ECDSA signatures** - secp256k1 recoverable signing, so that signers
//!   (transaction submitters, handshake peers) can be identified by public
//!   key recovery alone
//!
//! ## Example
//!
//! ```rust
//! use pofcore_crypto::ecdsa::PrivateKey;
//! use pofcore_types::Hash256;
//!
//! let key = PrivateKey::random();
//! let digest = Hash256::keccak256(b"message");
//! let sig = key.sign(&digest).unwrap();
//!
//! let recovered = pofcore_crypto::ecdsa::recover(&digest, &sig).unwrap();
//! assert_eq!(recovered, key.public_key());
//! assert_eq!(recovered.public_hash(), key.public_key().public_hash());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod ecdsa;

pub use ecdsa::{recover, recover_public_hash, PrivateKey, PublicKey};

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid private key bytes
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Failed to recover a public key from a signature
    #[error("failed to recover public key: {0}")]
    RecoveryFailed(String),

    /// Invalid input length
    #[error("invalid input length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected number of bytes
        expected: usize,
        /// Actual number of bytes
        actual: usize,
    },

    /// Hex decoding error
    #[error("hex decoding error: {0}")]
    HexError(#[from] hex::FromHexError),
}
