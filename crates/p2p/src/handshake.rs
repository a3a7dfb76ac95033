//! Signed challenge handshake.
//!
//! Both meshes prove key possession before a connection is installed. Each
//! side issues a 40-byte challenge record and answers the other side's with a
//! recoverable signature over its keccak digest:
//!
//! ```text
//! chain_id (1) | random nonce (31) | timestamp u64 LE nanoseconds (8)
//! ```
//!
//! The formulator→observer variant appends the formulator address to the
//! issued record. The node mesh additionally exchanges a bind-address
//! trailer (1-byte length + bytes) after each answer so acceptors learn the
//! dialer's listener address.
//!
//! Answers are rejected when the chain id differs or the embedded timestamp
//! deviates more than 30 s from local time.

use crate::{P2pError, Result};
use pofcore_crypto::ecdsa::{recover, PrivateKey};
use pofcore_types::{Hash256, PublicHash, Signature, SIGNATURE_SIZE};
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Base challenge record size.
pub const CHALLENGE_SIZE: usize = 40;

/// Maximum tolerated clock skew between peers.
pub const MAX_CLOCK_SKEW_NANOS: u64 = 30_000_000_000;

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}

/// Builds a challenge record: chain id, random nonce, current timestamp.
pub fn build_challenge(chain_id: u8) -> [u8; CHALLENGE_SIZE] {
    let mut record = [0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut record[..32]);
    record[0] = chain_id;
    record[32..].copy_from_slice(&now_nanos().to_le_bytes());
    record
}

/// Reads the peer's challenge, validates it, and answers with a signature.
///
/// `extra_len` is the number of trailing bytes the peer appends to the base
/// record (the formulator address on the observer-facing variant); the
/// signature covers the whole record including the trailer.
pub async fn answer_challenge<S>(
    conn: &mut S,
    key: &PrivateKey,
    chain_id: u8,
    extra_len: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut record = vec![0u8; CHALLENGE_SIZE + extra_len];
    conn.read_exact(&mut record).await?;

    if record[0] != chain_id {
        return Err(P2pError::InvalidChainId);
    }
    let timestamp = u64::from_le_bytes(record[32..40].try_into().expect("fixed slice"));
    let skew = now_nanos().abs_diff(timestamp);
    if skew > MAX_CLOCK_SKEW_NANOS {
        return Err(P2pError::InvalidHandshake);
    }

    let sig = key.sign(&Hash256::keccak256(&record))?;
    conn.write_all(sig.as_bytes()).await?;
    Ok(record.split_off(CHALLENGE_SIZE))
}

/// Issues our challenge and recovers the answering peer's identity.
///
/// `extra` is appended to the base record and covered by the peer's
/// signature.
pub async fn issue_challenge<S>(conn: &mut S, chain_id: u8, extra: &[u8]) -> Result<PublicHash>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let base = build_challenge(chain_id);
    let mut record = Vec::with_capacity(CHALLENGE_SIZE + extra.len());
    record.extend_from_slice(&base);
    record.extend_from_slice(extra);
    conn.write_all(&record).await?;

    let mut sig_bytes = [0u8; SIGNATURE_SIZE];
    conn.read_exact(&mut sig_bytes).await?;
    let sig = Signature::new(sig_bytes);

    let public_key = recover(&Hash256::keccak256(&record), &sig)?;
    Ok(public_key.public_hash())
}

/// Writes the node-mesh bind-address trailer.
pub async fn write_bind_addr<S>(conn: &mut S, bind_addr: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = bind_addr.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(P2pError::InvalidLength);
    }
    conn.write_all(&[bytes.len() as u8]).await?;
    conn.write_all(bytes).await?;
    Ok(())
}

/// Reads the node-mesh bind-address trailer.
pub async fn read_bind_addr<S>(conn: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    conn.read_exact(&mut len).await?;
    let mut bytes = vec![0u8; len[0] as usize];
    conn.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| P2pError::InvalidHandshake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pofcore_types::Address;

    #[tokio::test]
    async fn test_challenge_answer_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let key = PrivateKey::random();
        let expected = key.public_key().public_hash();

        let answer = tokio::spawn(async move {
            answer_challenge(&mut server, &key, 1, 0).await.unwrap();
        });

        let recovered = issue_challenge(&mut client, 1, &[]).await.unwrap();
        assert_eq!(recovered, expected);
        answer.await.unwrap();
    }

    #[tokio::test]
    async fn test_challenge_with_address_trailer() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let key = PrivateKey::random();
        let formulator = Address::new([0x42; 20]);

        let answer = tokio::spawn(async move {
            let extra = answer_challenge(&mut server, &key, 1, 20).await.unwrap();
            Address::from_slice(&extra).unwrap()
        });

        issue_challenge(&mut client, 1, formulator.as_bytes())
            .await
            .unwrap();
        assert_eq!(answer.await.unwrap(), formulator);
    }

    #[tokio::test]
    async fn test_wrong_chain_id_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let key = PrivateKey::random();

        let answer =
            tokio::spawn(async move { answer_challenge(&mut server, &key, 2, 0).await });

        let record = build_challenge(1);
        client.write_all(&record).await.unwrap();

        assert!(matches!(
            answer.await.unwrap(),
            Err(P2pError::InvalidChainId)
        ));
    }

    #[tokio::test]
    async fn test_stale_timestamp_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let key = PrivateKey::random();

        let answer =
            tokio::spawn(async move { answer_challenge(&mut server, &key, 1, 0).await });

        let mut record = build_challenge(1);
        let stale = now_nanos() - MAX_CLOCK_SKEW_NANOS - 1_000_000_000;
        record[32..].copy_from_slice(&stale.to_le_bytes());
        client.write_all(&record).await.unwrap();

        assert!(matches!(
            answer.await.unwrap(),
            Err(P2pError::InvalidHandshake)
        ));
    }

    #[tokio::test]
    async fn test_bind_addr_trailer_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_bind_addr(&mut client, ":38755").await.unwrap();
        assert_eq!(read_bind_addr(&mut server).await.unwrap(), ":38755");
    }
}
