//! Common wire messages shared by both meshes.

use crate::codec::WireMessage;
use pofcore_types::{Block, Hash256, Signature, Transaction};
use serde::{Deserialize, Serialize};

/// Keepalive marker message.
///
/// Pings travel as a bare type id with no body; this type exists so the ping
/// type id is derived the same way as every other message's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage;

impl WireMessage for PingMessage {
    const NAME: &'static str = "p2p.PingMessage";
}

/// A peer's advertised chain position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Protocol version
    pub version: u16,
    /// Committed tip height
    pub height: u32,
    /// Committed tip header hash
    pub last_hash: Hash256,
}

impl WireMessage for StatusMessage {
    const NAME: &'static str = "p2p.StatusMessage";
}

/// Request for `count` blocks starting at `height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// First requested height
    pub height: u32,
    /// Number of consecutive blocks, clamped to 1..=10 by the receiver
    pub count: u8,
}

impl WireMessage for RequestMessage {
    const NAME: &'static str = "p2p.RequestMessage";
}

/// A run of consecutive blocks answering a [`RequestMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMessage {
    /// The delivered blocks, ascending by height
    pub blocks: Vec<Block>,
}

impl WireMessage for BlockMessage {
    const NAME: &'static str = "p2p.BlockMessage";
}

/// A gossiped transaction with its submitter signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMessage {
    /// Transaction type id
    pub tx_type: u16,
    /// The transaction
    pub tx: Transaction,
    /// Submitter signatures
    pub sigs: Vec<Signature>,
}

impl WireMessage for TransactionMessage {
    const NAME: &'static str = "p2p.TransactionMessage";
}

/// Gossip of known peer addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListMessage {
    /// Known peer network addresses
    pub ips: Vec<String>,
    /// Hex peer identities parallel to `ips`
    pub hashes: Vec<String>,
}

impl WireMessage for PeerListMessage {
    const NAME: &'static str = "p2p.PeerListMessage";
}

/// Asks a peer for its peer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPeerListMessage;

impl WireMessage for RequestPeerListMessage {
    const NAME: &'static str = "p2p.RequestPeerListMessage";
}

/// Tracked status of one connected peer.
///
/// Heights only ever move forward; stale status traffic never regresses a
/// peer's recorded position.
#[derive(Debug, Clone, Default)]
pub struct Status {
    /// Advertised protocol version
    pub version: u16,
    /// Highest height the peer has advertised
    pub height: u32,
    /// Header hash the peer advertised for `height`
    pub last_hash: Hash256,
}

impl Status {
    /// Applies a status message, keeping the height monotonic.
    pub fn update(&mut self, msg: &StatusMessage) {
        if self.height < msg.height {
            self.version = msg.version;
            self.height = msg.height;
            self.last_hash = msg.last_hash;
        }
    }

    /// Raises the recorded height if `height` is ahead of it.
    pub fn raise_height(&mut self, height: u32) {
        if self.height < height {
            self.height = height;
        }
    }
}
