//! Transaction id packing utilities.
//!
//! A committed transaction is addressed by `(block height, index in block)`,
//! with an optional output index for multi-output transactions. These
//! helpers pack and unpack the two representations: a `u64` id and a
//! 12-character hex string.

use crate::{Error, Result};

/// Packs `(height, index, n)` into a single `u64` id.
pub fn marshal_id(height: u32, index: u16, n: u16) -> u64 {
    (height as u64) << 32 | (index as u64) << 16 | n as u64
}

/// Unpacks a `u64` id into `(height, index, n)`.
pub fn unmarshal_id(id: u64) -> (u32, u16, u16) {
    ((id >> 32) as u32, (id >> 16) as u16, id as u16)
}

/// Returns the hex transaction id string for `(height, index)`.
pub fn transaction_id(height: u32, index: u16) -> String {
    let mut bs = [0u8; 6];
    bs[..4].copy_from_slice(&height.to_be_bytes());
    bs[4..].copy_from_slice(&index.to_be_bytes());
    hex::encode(bs)
}

/// Parses a hex transaction id string back into `(height, index)`.
pub fn parse_transaction_id(txid: &str) -> Result<(u32, u16)> {
    if txid.len() != 12 {
        return Err(Error::InvalidTransactionIdFormat);
    }
    let bs = hex::decode(txid).map_err(|_| Error::InvalidTransactionIdFormat)?;
    let height = u32::from_be_bytes([bs[0], bs[1], bs[2], bs[3]]);
    let index = u16::from_be_bytes([bs[4], bs[5]]);
    Ok((height, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_unmarshal_roundtrip() {
        for &(h, i, n) in &[
            (0u32, 0u16, 0u16),
            (1, 2, 3),
            (u32::MAX, u16::MAX, u16::MAX),
            (0xdead_beef, 0x1234, 0x5678),
        ] {
            assert_eq!(unmarshal_id(marshal_id(h, i, n)), (h, i, n));
        }
    }

    #[test]
    fn test_unmarshal_marshal_roundtrip() {
        for &id in &[0u64, 1, u64::MAX, 0x0123_4567_89ab_cdef] {
            let (h, i, n) = unmarshal_id(id);
            assert_eq!(marshal_id(h, i, n), id);
        }
    }

    #[test]
    fn test_transaction_id_roundtrip() {
        for &(h, i) in &[(0u32, 0u16), (10, 3), (u32::MAX, u16::MAX)] {
            let txid = transaction_id(h, i);
            assert_eq!(txid.len(), 12);
            assert_eq!(parse_transaction_id(&txid).unwrap(), (h, i));
        }
    }

    #[test]
    fn test_parse_transaction_id_rejects_bad_input() {
        assert!(parse_transaction_id("").is_err());
        assert!(parse_transaction_id("0011223344").is_err());
        assert!(parse_transaction_id("00112233445g").is_err());
    }
}
