//! Items carried on the prioritized send/recv queues.
//!
//! The node separates block traffic from transaction traffic from peer
//! management traffic; a pair of drain tasks pull these items from per-class
//! channels in priority order.

use pofcore_types::PublicHash;

/// A received, decoded message awaiting dispatch.
#[derive(Debug)]
pub struct RecvItem<M> {
    /// The delivering peer
    pub peer: PublicHash,
    /// The decoded message
    pub message: M,
}

/// An outbound frame awaiting transmission.
#[derive(Debug)]
pub struct SendItem {
    /// Single target, or `None` to fan out
    pub target: Option<PublicHash>,
    /// Pre-encoded wire frame
    pub packet: Vec<u8>,
    /// When fanning out, cap on random targets (0 = every peer); when a
    /// target is set together with a nonzero limit, the target is excluded
    /// from the sample instead
    pub limit: u8,
}

impl SendItem {
    /// Frame addressed to one peer.
    pub fn to(target: PublicHash, packet: Vec<u8>) -> Self {
        Self {
            target: Some(target),
            packet,
            limit: 0,
        }
    }

    /// Frame broadcast to every peer.
    pub fn broadcast(packet: Vec<u8>) -> Self {
        Self {
            target: None,
            packet,
            limit: 0,
        }
    }

    /// Frame gossiped to a few random peers.
    pub fn limited(packet: Vec<u8>, limit: u8) -> Self {
        Self {
            target: None,
            packet,
            limit,
        }
    }

    /// Frame gossiped to a few random peers excluding `except`.
    pub fn limited_except(except: PublicHash, packet: Vec<u8>, limit: u8) -> Self {
        Self {
            target: Some(except),
            packet,
            limit,
        }
    }
}
