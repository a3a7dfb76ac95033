//! # ECDSA signatures using secp256k1
//!
//! Recoverable signing and public key recovery over pre-hashed 32-byte
//! digests. Signatures are the 65-byte `r|s|v` layout from
//! `pofcore_types::Signature`, so that a signer's public key (and from it the
//! peer identity [`PublicHash`]) can be recovered from any signed digest.
//!
//! ## Example
//!
//! ```rust
//! use pofcore_crypto::ecdsa::{recover, PrivateKey};
//! use pofcore_types::Hash256;
//!
//! let key = PrivateKey::random();
//! let digest = Hash256::keccak256(b"block header bytes");
//!
//! let sig = key.sign(&digest).unwrap();
//! let recovered = recover(&digest, &sig).unwrap();
//! assert_eq!(recovered, key.public_key());
//! ```

use crate::{CryptoError, Result};
use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::SecretKey;
use pofcore_types::{Address, Hash256, PublicHash, Signature};
use rand::rngs::OsRng;

/// ECDSA private key (32 bytes).
///
/// This is the secret key used for signing. Keep it secure!
#[derive(Clone)]
pub struct PrivateKey {
    inner: SigningKey,
}

impl PrivateKey {
    /// Generate a random private key using a cryptographically secure RNG.
    pub fn random() -> Self {
        let secret_key = SecretKey::random(&mut OsRng);
        Self {
            inner: SigningKey::from(secret_key),
        }
    }

    /// Create a private key from raw bytes.
    ///
    /// Returns an error if the bytes don't represent a valid private key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secret_key = SecretKey::from_bytes(bytes.into())
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            inner: SigningKey::from(secret_key),
        })
    }

    /// Create a private key from a hex string (with or without 0x prefix).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Self::from_bytes(&arr)
    }

    /// Get the raw bytes of the private key.
    ///
    /// # Security
    ///
    /// Be careful with the returned bytes - they are the secret key!
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes().into()
    }

    /// Derive the public key from this private key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: *self.inner.verifying_key(),
        }
    }

    /// Sign a 32-byte digest, producing a recoverable signature.
    pub fn sign(&self, digest: &Hash256) -> Result<Signature> {
        let (sig, recovery_id) = self
            .inner
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&sig.r().to_bytes());
        out[32..64].copy_from_slice(&sig.s().to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(Signature::new(out))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public_hash", &self.public_key().public_hash())
            .finish()
    }
}

/// ECDSA public key on secp256k1.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Create a public key from SEC1-encoded bytes (compressed or not).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { inner })
    }

    /// The uncompressed 64-byte point (without the SEC1 tag byte).
    pub fn to_uncompressed_bytes(&self) -> [u8; 64] {
        let point = self.inner.to_encoded_point(false);
        let mut out = [0u8; 64];
        out.copy_from_slice(&point.as_bytes()[1..]);
        out
    }

    /// Derive the 32-byte peer identity for this key.
    ///
    /// `public_hash = keccak256(uncompressed point bytes)`.
    pub fn public_hash(&self) -> PublicHash {
        PublicHash::from(Hash256::keccak256(&self.to_uncompressed_bytes()))
    }

    /// Derive the 20-byte account address for this key.
    ///
    /// The last 20 bytes of the keccak256 digest of the uncompressed point.
    pub fn to_address(&self) -> Address {
        let digest = Hash256::keccak256(&self.to_uncompressed_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.as_bytes()[12..]);
        Address::new(out)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.public_hash())
    }
}

/// Recover the public key that signed `digest`.
pub fn recover(digest: &Hash256, signature: &Signature) -> Result<PublicKey> {
    let bytes = signature.as_fixed_bytes();
    let sig = K256Signature::from_slice(&bytes[..64])
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let recovery_id = RecoveryId::from_byte(bytes[64])
        .ok_or_else(|| CryptoError::InvalidSignature(format!("bad recovery byte {}", bytes[64])))?;

    let inner = VerifyingKey::recover_from_prehash(digest.as_bytes(), &sig, recovery_id)
        .map_err(|e| CryptoError::RecoveryFailed(e.to_string()))?;
    Ok(PublicKey { inner })
}

/// Recover the signer's peer identity directly.
///
/// Shorthand for `recover(digest, signature)?.public_hash()`.
pub fn recover_public_hash(digest: &Hash256, signature: &Signature) -> Result<PublicHash> {
    Ok(recover(digest, signature)?.public_hash())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_recover() {
        let key = PrivateKey::random();
        let digest = Hash256::keccak256(b"payload");
        let sig = key.sign(&digest).unwrap();

        let recovered = recover(&digest, &sig).unwrap();
        assert_eq!(recovered, key.public_key());
        assert_eq!(recovered.public_hash(), key.public_key().public_hash());
    }

    #[test]
    fn test_recover_rejects_wrong_digest() {
        let key = PrivateKey::random();
        let sig = key.sign(&Hash256::keccak256(b"one")).unwrap();

        // Recovery over a different digest yields a different key (or fails).
        match recover(&Hash256::keccak256(b"two"), &sig) {
            Ok(other) => assert_ne!(other, key.public_key()),
            Err(_) => {}
        }
    }

    #[test]
    fn test_private_key_hex_roundtrip() {
        let key = PrivateKey::random();
        let restored = PrivateKey::from_hex(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(restored.public_key(), key.public_key());
    }

    #[test]
    fn test_private_key_bad_hex() {
        assert!(PrivateKey::from_hex("0x1234").is_err());
        assert!(PrivateKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_public_hash_is_deterministic() {
        let key = PrivateKey::random();
        assert_eq!(key.public_key().public_hash(), key.public_key().public_hash());
    }

    #[test]
    fn test_address_is_suffix_of_public_hash() {
        let key = PrivateKey::random();
        let ph = key.public_key().public_hash();
        let addr = key.public_key().to_address();
        assert_eq!(addr.as_bytes(), &ph.as_bytes()[12..]);
    }
}
