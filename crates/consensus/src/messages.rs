//! PoF wire messages and the node's codec.

use pofcore_p2p::{
    BlockMessage, MessageCodec, PeerListMessage, PingMessage, RequestMessage,
    RequestPeerListMessage, StatusMessage, TransactionMessage, WireMessage,
};
use pofcore_types::{Address, Block, BlockSign, Hash256, PublicHash, Signature};
use serde::{Deserialize, Serialize};

/// Observer request for the next run of blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReqMessage {
    /// Hash the new run must build on (the observers' view of the tip)
    pub prev_hash: Hash256,
    /// First height of the run
    pub target_height: u32,
    /// Rank offset into the formulator table; 0 is the primary slot
    pub timeout_count: u32,
    /// The formulator expected to produce the run
    pub formulator: Address,
    /// That formulator's signing identity
    pub formulator_public_hash: PublicHash,
}

impl WireMessage for BlockReqMessage {
    const NAME: &'static str = "pof.BlockReqMessage";
}

/// One generated block streamed back to the requesting observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockGenMessage {
    /// The generated block, signatures not yet assembled
    pub block: Block,
    /// The formulator's signature over the header hash
    pub generator_signature: Signature,
    /// Whether this is a relayed copy rather than the original emission
    pub is_reply: bool,
}

impl WireMessage for BlockGenMessage {
    const NAME: &'static str = "pof.BlockGenMessage";
}

/// The observer cohort's aggregated signatures for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockObSignMessage {
    /// Height being confirmed
    pub target_height: u32,
    /// The co-signed view of the header
    pub block_sign: BlockSign,
    /// Observer signatures in aggregation order
    pub observer_signatures: Vec<Signature>,
}

impl WireMessage for BlockObSignMessage {
    const NAME: &'static str = "pof.BlockObSignMessage";
}

/// Every message the formulator sends or receives, over either mesh.
#[derive(Debug, Clone)]
pub enum PofMessage {
    /// Observer block request
    BlockReq(BlockReqMessage),
    /// Generated block (seen when relayed back)
    BlockGen(BlockGenMessage),
    /// Aggregated observer signatures
    BlockObSign(BlockObSignMessage),
    /// Keepalive
    Ping(PingMessage),
    /// Peer chain position
    Status(StatusMessage),
    /// Block fetch request
    Request(RequestMessage),
    /// Block fetch response
    Block(BlockMessage),
    /// Gossiped transaction
    Transaction(TransactionMessage),
    /// Peer list gossip
    PeerList(PeerListMessage),
    /// Peer list request
    RequestPeerList(RequestPeerListMessage),
}

macro_rules! impl_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for PofMessage {
            fn from(msg: $ty) -> Self {
                PofMessage::$variant(msg)
            }
        }
    };
}

impl_from!(BlockReq, BlockReqMessage);
impl_from!(BlockGen, BlockGenMessage);
impl_from!(BlockObSign, BlockObSignMessage);
impl_from!(Ping, PingMessage);
impl_from!(Status, StatusMessage);
impl_from!(Request, RequestMessage);
impl_from!(Block, BlockMessage);
impl_from!(Transaction, TransactionMessage);
impl_from!(PeerList, PeerListMessage);
impl_from!(RequestPeerList, RequestPeerListMessage);

/// The wire type id a [`PofMessage`] variant travels under.
pub fn wire_type_id(msg: &PofMessage) -> u16 {
    match msg {
        PofMessage::BlockReq(_) => BlockReqMessage::type_id(),
        PofMessage::BlockGen(_) => BlockGenMessage::type_id(),
        PofMessage::BlockObSign(_) => BlockObSignMessage::type_id(),
        PofMessage::Ping(_) => PingMessage::type_id(),
        PofMessage::Status(_) => StatusMessage::type_id(),
        PofMessage::Request(_) => RequestMessage::type_id(),
        PofMessage::Block(_) => BlockMessage::type_id(),
        PofMessage::Transaction(_) => TransactionMessage::type_id(),
        PofMessage::PeerList(_) => PeerListMessage::type_id(),
        PofMessage::RequestPeerList(_) => RequestPeerListMessage::type_id(),
    }
}

/// Builds the codec registry covering every message the node understands.
pub fn build_codec() -> MessageCodec<PofMessage> {
    let mut codec = MessageCodec::new();
    codec.register::<BlockReqMessage>();
    codec.register::<BlockGenMessage>();
    codec.register::<BlockObSignMessage>();
    codec.register::<PingMessage>();
    codec.register::<StatusMessage>();
    codec.register::<RequestMessage>();
    codec.register::<BlockMessage>();
    codec.register::<TransactionMessage>();
    codec.register::<PeerListMessage>();
    codec.register::<RequestPeerListMessage>();
    codec
}

#[cfg(test)]
mod tests {
    use super::*;
    use pofcore_p2p::codec::encode_packet;

    #[test]
    fn test_codec_covers_pof_messages() {
        let codec = build_codec();
        assert!(codec.knows(BlockReqMessage::type_id()));
        assert!(codec.knows(BlockObSignMessage::type_id()));
        assert!(codec.knows(StatusMessage::type_id()));
        assert!(!codec.knows(0));
    }

    #[test]
    fn test_block_req_roundtrip_through_codec() {
        let codec = build_codec();
        let msg = BlockReqMessage {
            prev_hash: Hash256::keccak256(b"tip"),
            target_height: 11,
            timeout_count: 0,
            formulator: Address::new([1u8; 20]),
            formulator_public_hash: PublicHash::from(Hash256::keccak256(b"key")),
        };

        let frame = encode_packet(&msg).unwrap();
        let type_id = u16::from_le_bytes([frame[0], frame[1]]);
        assert_eq!(type_id, BlockReqMessage::type_id());

        let decoded = codec.decode(type_id, &frame[7..]).unwrap();
        match decoded {
            PofMessage::BlockReq(decoded) => assert_eq!(decoded, msg),
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
