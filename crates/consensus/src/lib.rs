//! # PoF Core Consensus
//!
//! The Proof-of-Formulation round driver: one designated formulator produces
//! runs of blocks on observer request; the observer cohort co-signs them.
//!
//! This crate implements the formulator side:
//! - [`FormulatorNode`] - the node itself: round state machine, generation
//!   loop, tip advancement, transaction admission and gossip
//! - [`ObserverMesh`] - the fixed observer peer set with reconnect loops
//! - [`BlockQueue`] - height-ordered queueing of out-of-order blocks
//! - [`StatusBoard`] - per-peer chain positions driving block requests
//! - the PoF wire messages ([`BlockReqMessage`], [`BlockGenMessage`],
//!   [`BlockObSignMessage`])
//!
//! ## Round flow
//!
//! 1. Observers agree a formulator is due and send `BlockReqMessage`.
//! 2. The formulator validates the request against its ranking table and
//!    tip, then emits up to `max_blocks_per_formulator` consecutive
//!    `BlockGenMessage`s, pacing emissions at the block cadence.
//! 3. The observers answer each block with an aggregated
//!    `BlockObSignMessage`; the formulator assembles the final signature
//!    list and commits blocks strictly in height order.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod block_queue;
pub mod formulator;
pub mod messages;
pub mod observer_mesh;
pub mod status;

pub use block_queue::BlockQueue;
pub use formulator::{FormulatorConfig, FormulatorNode};
pub use messages::{
    build_codec, BlockGenMessage, BlockObSignMessage, BlockReqMessage, PofMessage,
};
pub use observer_mesh::{ObserverHandler, ObserverMesh};
pub use status::StatusBoard;

/// Result type alias for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors that can occur while driving rounds and advancing the tip
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// A block request failed validation against the ranking table or tip.
    /// Round-scope: the message is discarded, the peer survives.
    #[error("invalid request")]
    InvalidRequest,

    /// The observer peer id is not connected
    #[error("not exist observer peer")]
    NotExistObserverPeer,

    /// The node is shut down
    #[error("node closed")]
    Closed,

    /// Chain collaborator error
    #[error(transparent)]
    Chain(#[from] pofcore_chain::ChainError),

    /// Transaction admission error
    #[error(transparent)]
    Pool(#[from] pofcore_txpool::PoolError),

    /// Transport error
    #[error(transparent)]
    P2p(#[from] pofcore_p2p::P2pError),

    /// Signing or recovery error
    #[error(transparent)]
    Crypto(#[from] pofcore_crypto::CryptoError),
}
