//! Height-ordered queue of received blocks.
//!
//! Blocks arriving ahead of the tip wait here until the chain catches up;
//! they are popped strictly in height order. Re-inserting a height surfaces
//! the already-queued block so the caller can compare header hashes for
//! fork detection.

use pofcore_types::Block;
use std::collections::BTreeMap;

/// Height-sorted block queue.
#[derive(Default)]
pub struct BlockQueue {
    blocks: BTreeMap<u32, Block>,
}

impl BlockQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The queued block at `height`, if any.
    pub fn find(&self, height: u32) -> Option<&Block> {
        self.blocks.get(&height)
    }

    /// Queues a block unless its height is already present.
    ///
    /// Returns the existing block for the height when there is one, leaving
    /// it in place; the caller compares header hashes for fork detection.
    pub fn find_or_insert(&mut self, block: Block) -> Option<&Block> {
        match self.blocks.entry(block.header.height) {
            std::collections::btree_map::Entry::Occupied(entry) => Some(entry.into_mut()),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(block);
                None
            }
        }
    }

    /// Pops the block at exactly `height`, discarding any stale entries
    /// below it.
    pub fn pop_exact(&mut self, height: u32) -> Option<Block> {
        while let Some((&lowest, _)) = self.blocks.iter().next() {
            if lowest >= height {
                break;
            }
            self.blocks.remove(&lowest);
        }
        self.blocks.remove(&height)
    }
}
