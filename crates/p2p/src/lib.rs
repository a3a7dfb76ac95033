//! # PoF Core P2P
//!
//! Framed TCP transport and node mesh for the PoF Core block production
//! engine.
//!
//! This crate provides the network substrate shared by both meshes:
//! - [`Peer`] - one connection: length-prefixed typed frames, optional gzip,
//!   keepalive pings with a 3-miss close policy, 5 s write deadlines
//! - [`MessageCodec`] - an explicit type-id → decoder registry built at
//!   startup and handed to every peer
//! - [`handshake`] - the timestamp-nonced, signed challenge exchange that
//!   pins the chain id, bounds clock skew at 30 s and proves key possession
//! - [`NodeMesh`] - the dynamic peer set: seed reconnect loops, an accept
//!   loop, client/server peer maps and peer-list gossip
//! - [`RequestTimer`] - per-height in-flight request tracking with expiry
//!
//! ## Wire frame
//!
//! ```text
//! u16 type_id (LE) | u32 payload_len (LE) | u8 gzip_flag | payload
//! ```
//!
//! A lone ping type id between frames is a keepalive and carries no body.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod codec;
pub mod handshake;
pub mod messages;
pub mod node_mesh;
pub mod nodestore;
pub mod peer;
pub mod queue;
pub mod request_timer;

pub use codec::{message_type_id, MessageCodec, WireMessage};
pub use messages::{
    BlockMessage, PeerListMessage, PingMessage, RequestMessage, RequestPeerListMessage, Status,
    StatusMessage, TransactionMessage,
};
pub use node_mesh::{MeshHandler, NodeMesh};
pub use nodestore::{MemoryNodeStore, NodePoolStore};
pub use peer::{Peer, PeerReader};
pub use queue::{RecvItem, SendItem};
pub use request_timer::RequestTimer;

/// Result type alias for p2p operations
pub type Result<T> = std::result::Result<T, P2pError>;

/// Errors that can occur on the transport and mesh layer
#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    /// The handshake record was malformed or the clock skew exceeded 30 s
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The handshake carried a different chain id
    #[error("invalid chain id")]
    InvalidChainId,

    /// The recovered peer identity did not match the dialed target
    #[error("invalid public hash")]
    InvalidPublicHash,

    /// No decoder is registered for the received type id
    #[error("unknown message type {0:#06x}")]
    UnknownMessage(u16),

    /// A frame field had an impossible length
    #[error("invalid length")]
    InvalidLength,

    /// The peer id is not connected on this mesh
    #[error("not exist peer")]
    NotExistPeer,

    /// The peer was closed while sending
    #[error("peer closed")]
    PeerClosed,

    /// A write missed its 5 s deadline
    #[error("write timed out")]
    WriteTimeout,

    /// The dial missed its 10 s deadline
    #[error("connect timed out")]
    ConnectTimeout,

    /// Underlying socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization failed
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Signature recovery failed during the handshake
    #[error("crypto error: {0}")]
    Crypto(#[from] pofcore_crypto::CryptoError),
}
