//! Collaborator traits the block production core consumes.
//!
//! Implementations must be thread-safe where marked `Sync`; the formulator
//! node shares them across its handler tasks and timers.

use crate::Result;
use pofcore_types::{Address, Block, Hash256, PublicHash, Signature, Transaction};
use std::any::Any;

/// An ephemeral staging layer over committed ledger state.
///
/// A context is created per round and consumed by at most one block-connect
/// call. Snapshot tokens nest: reverting to a token discards every change
/// made after it was taken.
pub trait Context: Send {
    /// Takes a snapshot and returns its token.
    fn snapshot(&mut self) -> u32;

    /// Reverts all changes made since the snapshot token was taken.
    fn revert(&mut self, token: u32);

    /// Discards the snapshot token, keeping the changes made since.
    fn commit(&mut self, token: u32);

    /// Current sequence number of an account under this context.
    fn seq(&self, addr: &Address) -> u64;

    /// The parent block hash this context is anchored to.
    fn prev_hash(&self) -> Hash256;

    /// The timestamp of the parent block.
    fn last_timestamp(&self) -> u64;

    /// The height this context would commit at.
    fn target_height(&self) -> u32;

    /// Derives a fresh child context for the next block in the same
    /// formulator slot, anchored at the just-generated header.
    fn next_context(&self, prev_header_hash: Hash256, prev_timestamp: u64) -> Box<dyn Context>;

    /// Downcasting hook; a committer uses this to recover the concrete
    /// context type it handed out.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Read access to the committed chain.
pub trait Provider: Send + Sync {
    /// Chain identifier.
    fn chain_id(&self) -> u8;

    /// Protocol version advertised in status messages.
    fn version(&self) -> u16;

    /// Height of the committed tip.
    fn height(&self) -> u32;

    /// Header hash of the committed tip.
    fn last_hash(&self) -> Hash256;

    /// Timestamp of the committed tip.
    fn last_timestamp(&self) -> u64;

    /// Tip height and hash read atomically.
    fn last_status(&self) -> (u32, Hash256);

    /// Header hash of the block at `height`.
    fn hash(&self, height: u32) -> Result<Hash256>;

    /// The full block at `height`.
    fn block(&self, height: u32) -> Result<Block>;
}

/// Assembles one block transaction by transaction against a live context.
pub trait BlockCreator: Send {
    /// Applies a transaction to the staged state and records it for the
    /// block. "Unsafe" because the caller is expected to have checked pool
    /// admission already; on failure the staged state is left unchanged.
    #[allow(clippy::too_many_arguments)]
    fn unsafe_add_tx(
        &mut self,
        generator: Address,
        tx_type: u16,
        tx_hash: Hash256,
        tx: Transaction,
        signatures: Vec<Signature>,
        signers: Vec<PublicHash>,
    ) -> Result<()>;

    /// The context the creator is staging against, for snapshot/revert
    /// bracketing around candidate pops.
    fn context_mut(&mut self) -> &mut dyn Context;

    /// Finalizes the block at the chosen timestamp, returning it together
    /// with the context that produced it (for the later commit).
    fn finalize(self: Box<Self>, timestamp: u64) -> Result<(Block, Box<dyn Context>)>;
}

/// Context creation and block connection.
pub trait Committer: Send + Sync {
    /// Creates a fresh context anchored at the committed tip.
    fn new_context(&self) -> Box<dyn Context>;

    /// Starts assembling a block on top of `ctx`.
    fn new_block_creator(
        &self,
        ctx: Box<dyn Context>,
        generator: Address,
        consensus_data: Vec<u8>,
    ) -> Result<Box<dyn BlockCreator>>;

    /// Validates and commits a block by re-executing it.
    fn connect_block(&self, block: &Block) -> Result<()>;

    /// Commits a block using the pre-executed context it was built with.
    fn connect_block_with_context(&self, block: &Block, ctx: Box<dyn Context>) -> Result<()>;
}

/// The full chain collaborator.
pub trait Chain: Provider + Committer {
    /// Shuts the chain down; subsequent connects fail.
    fn close(&self);
}

/// The formulator ranking table for the current round.
pub trait FormulatorRank: Send + Sync {
    /// The formulator ranked at `timeout_count` (rank 0 is the primary).
    fn top_rank(&self, timeout_count: u32) -> Result<Address>;

    /// How many consecutive blocks the current slot's formulator has already
    /// produced, which shortens its remaining allowance.
    fn blocks_by_same_formulator(&self) -> u32;
}
