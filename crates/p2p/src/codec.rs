//! Typed message codec.
//!
//! Every wire message declares a qualified name; its 16-bit type id is a
//! keccak hash of that name. The [`MessageCodec`] registry maps type ids to
//! decoders producing the application's message enum, and is constructed
//! once at startup and shared with every peer.
//!
//! Encoding produces a complete frame: payloads over 1000 bytes are gzipped
//! and flagged; receivers honor the flag.

use crate::{P2pError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use pofcore_types::Hash256;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};

/// Payloads above this many bytes are gzipped on the wire.
pub const COMPRESSION_THRESHOLD: usize = 1000;

/// Computes the 16-bit type id for a qualified message name.
pub fn message_type_id(name: &str) -> u16 {
    let digest = Hash256::keccak256(name.as_bytes());
    u16::from_le_bytes([digest.as_bytes()[0], digest.as_bytes()[1]])
}

/// A typed wire message with a stable qualified name.
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Qualified message name, e.g. `"p2p.StatusMessage"`.
    const NAME: &'static str;

    /// The message's 16-bit type id.
    fn type_id() -> u16 {
        message_type_id(Self::NAME)
    }
}

type DecodeFn<M> = Box<dyn Fn(&[u8]) -> Result<M> + Send + Sync>;

/// Registry mapping type ids to decoders for the application message enum.
pub struct MessageCodec<M> {
    decoders: HashMap<u16, DecodeFn<M>>,
}

impl<M: Send + 'static> MessageCodec<M> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers a message type, decoding into the application enum.
    pub fn register<T>(&mut self)
    where
        T: WireMessage + Into<M>,
    {
        self.decoders.insert(
            T::type_id(),
            Box::new(|payload| {
                let msg: T = bincode::deserialize(payload)?;
                Ok(msg.into())
            }),
        );
    }

    /// Decodes a decompressed payload by type id.
    pub fn decode(&self, type_id: u16, payload: &[u8]) -> Result<M> {
        let decode = self
            .decoders
            .get(&type_id)
            .ok_or(P2pError::UnknownMessage(type_id))?;
        decode(payload)
    }

    /// Whether a type id is registered.
    pub fn knows(&self, type_id: u16) -> bool {
        self.decoders.contains_key(&type_id)
    }
}

impl<M: Send + 'static> Default for MessageCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a message into a complete wire frame.
pub fn encode_packet<T: WireMessage>(msg: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;

    let (flag, body) = if payload.len() > COMPRESSION_THRESHOLD {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        (1u8, encoder.finish()?)
    } else {
        (0u8, payload)
    };

    let mut out = Vec::with_capacity(7 + body.len());
    out.extend_from_slice(&T::type_id().to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.push(flag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Builds the bare keepalive frame for a ping type id.
pub fn ping_packet(ping_type: u16) -> [u8; 2] {
    ping_type.to_le_bytes()
}

/// Decompresses a frame body according to its gzip flag.
pub fn decompress(flag: u8, body: Vec<u8>) -> Result<Vec<u8>> {
    if flag == 0 {
        return Ok(body);
    }
    let mut decoder = GzDecoder::new(body.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Small {
        n: u32,
    }

    impl WireMessage for Small {
        const NAME: &'static str = "test.Small";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Large {
        data: Vec<u8>,
    }

    impl WireMessage for Large {
        const NAME: &'static str = "test.Large";
    }

    #[derive(Debug, PartialEq)]
    enum TestMessage {
        Small(Small),
        Large(Large),
    }

    impl From<Small> for TestMessage {
        fn from(m: Small) -> Self {
            TestMessage::Small(m)
        }
    }

    impl From<Large> for TestMessage {
        fn from(m: Large) -> Self {
            TestMessage::Large(m)
        }
    }

    fn codec() -> MessageCodec<TestMessage> {
        let mut codec = MessageCodec::new();
        codec.register::<Small>();
        codec.register::<Large>();
        codec
    }

    fn split_frame(frame: &[u8]) -> (u16, u32, u8, Vec<u8>) {
        let type_id = u16::from_le_bytes([frame[0], frame[1]]);
        let len = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
        (type_id, len, frame[6], frame[7..].to_vec())
    }

    #[test]
    fn test_type_id_is_stable_and_distinct() {
        assert_eq!(Small::type_id(), message_type_id("test.Small"));
        assert_ne!(Small::type_id(), Large::type_id());
    }

    #[test]
    fn test_small_payload_stays_raw() {
        let msg = Small { n: 7 };
        let frame = encode_packet(&msg).unwrap();
        let (type_id, len, flag, body) = split_frame(&frame);

        assert_eq!(type_id, Small::type_id());
        assert_eq!(len as usize, body.len());
        assert_eq!(flag, 0);

        let decoded = codec().decode(type_id, &decompress(flag, body).unwrap()).unwrap();
        assert_eq!(decoded, TestMessage::Small(msg));
    }

    #[test]
    fn test_large_payload_is_gzipped() {
        let msg = Large {
            data: vec![0xaa; 5_000],
        };
        let frame = encode_packet(&msg).unwrap();
        let (type_id, len, flag, body) = split_frame(&frame);

        assert_eq!(flag, 1);
        assert_eq!(len as usize, body.len());
        assert!(body.len() < 5_000, "compressible payload should shrink");

        let decoded = codec().decode(type_id, &decompress(flag, body).unwrap()).unwrap();
        assert_eq!(decoded, TestMessage::Large(msg));
    }

    #[test]
    fn test_unknown_type_id_is_rejected() {
        let err = codec().decode(0xffff, &[]).unwrap_err();
        assert!(matches!(err, P2pError::UnknownMessage(0xffff)));
    }
}
