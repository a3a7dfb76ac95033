//! Account and peer identity types.
//!
//! This module provides:
//! - [`Address`] - a 20-byte account identifier (block generators, tx senders)
//! - [`PublicHash`] - a 32-byte identity derived from a public key, used as
//!   the peer id on both meshes

use crate::{Error, Hash256, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size of an address in bytes
pub const ADDRESS_SIZE: usize = 20;

/// Size of a public hash in bytes
pub const PUBLIC_HASH_SIZE: usize = 32;

/// A 20-byte account identifier.
///
/// # Example
///
/// ```rust
/// use pofcore_types::Address;
///
/// let addr: Address = "0x742d35cc6634c0532925a3b844bc9e7595f0beb1".parse().unwrap();
/// assert_eq!(addr.to_hex(), "0x742d35cc6634c0532925a3b844bc9e7595f0beb1");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    /// The zero address.
    pub const ZERO: Self = Self([0u8; ADDRESS_SIZE]);

    /// Creates a new address from a 20-byte array.
    #[inline]
    pub const fn new(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates an address from a slice.
    ///
    /// Returns an error if the slice length is not exactly 20 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != ADDRESS_SIZE {
            return Err(Error::InvalidLength {
                expected: ADDRESS_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Returns the address as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the address as a fixed-size byte array.
    #[inline]
    pub const fn as_fixed_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    /// Checks if this is the zero address.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }

    /// Creates an address from its hex representation.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != ADDRESS_SIZE * 2 {
            return Err(Error::InvalidAddress(format!(
                "expected {} hex characters, got {}",
                ADDRESS_SIZE * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    /// Returns the hex representation with 0x prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<[u8; ADDRESS_SIZE]> for Address {
    fn from(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Address {
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

impl<'de> Deserialize<'de> for Address {
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

/// A 32-byte identity derived from a public key.
///
/// Peer ids on both the observer mesh and the node mesh are public hashes:
/// `keccak256(uncompressed public key bytes)`. The derivation itself lives in
/// the crypto crate; this type is the raw identity value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PublicHash([u8; PUBLIC_HASH_SIZE]);

impl PublicHash {
    /// The zero public hash, used as the "broadcast" sentinel target.
    pub const ZERO: Self = Self([0u8; PUBLIC_HASH_SIZE]);

    /// Creates a new public hash from a 32-byte array.
    #[inline]
    pub const fn new(bytes: [u8; PUBLIC_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a public hash from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != PUBLIC_HASH_SIZE {
            return Err(Error::InvalidLength {
                expected: PUBLIC_HASH_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; PUBLIC_HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Returns the public hash as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Checks if this is the zero public hash.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }

    /// Returns the hex representation with 0x prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Creates a public hash from its hex representation.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl From<Hash256> for PublicHash {
    fn from(hash: Hash256) -> Self {
        Self(*hash.as_fixed_bytes())
    }
}

impl From<[u8; PUBLIC_HASH_SIZE]> for PublicHash {
    fn from(bytes: [u8; PUBLIC_HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PublicHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicHash(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for PublicHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for PublicHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicHash {
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

impl<'de> Deserialize<'de> for PublicHash {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_hex_roundtrip() {
        let addr: Address = "0x742d35cc6634c0532925a3b844bc9e7595f0beb1".parse().unwrap();
        assert_eq!(addr.to_hex(), "0x742d35cc6634c0532925a3b844bc9e7595f0beb1");
    }

    #[test]
    fn test_address_invalid() {
        assert!(Address::from_hex("0x1234").is_err());
        assert!(Address::from_slice(&[0u8; 19]).is_err());
    }

    #[test]
    fn test_zero_address() {
        assert!(Address::ZERO.is_zero());
        assert!(!Address::new([1u8; 20]).is_zero());
    }

    #[test]
    fn test_public_hash_from_hash() {
        let h = Hash256::keccak256(b"key");
        let ph = PublicHash::from(h);
        assert_eq!(ph.as_bytes(), h.as_bytes());
    }

    #[test]
    fn test_public_hash_serde_bincode() {
        let ph = PublicHash::from(Hash256::keccak256(b"peer"));
        let bytes = bincode::serialize(&ph).unwrap();
        let decoded: PublicHash = bincode::deserialize(&bytes).unwrap();
        assert_eq!(ph, decoded);
    }
}
