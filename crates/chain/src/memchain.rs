//! In-memory reference chain.
//!
//! [`MemChain`] implements the full collaborator seam against a plain
//! account→sequence map. It exists for tests and for the demo binary; a
//! production embedder supplies its own [`Chain`] implementation backed by
//! persistent storage.

use crate::traits::{BlockCreator, Chain, Committer, Context, FormulatorRank, Provider};
use crate::{ChainError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use pofcore_types::{Address, Block, Hash256, Header, PublicHash, Signature, Transaction};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Digest of an account→sequence map, used as the header's context hash.
fn state_digest(accounts: &HashMap<Address, u64>) -> Hash256 {
    let mut entries: Vec<(&Address, &u64)> = accounts.iter().collect();
    entries.sort_by_key(|(addr, _)| **addr);

    let mut buf = Vec::with_capacity(entries.len() * 28);
    for (addr, seq) in entries {
        buf.extend_from_slice(addr.as_bytes());
        buf.extend_from_slice(&seq.to_le_bytes());
    }
    Hash256::keccak256(&buf)
}

/// Staging context over a [`MemChain`].
pub struct MemContext {
    accounts: HashMap<Address, u64>,
    snapshots: Vec<HashMap<Address, u64>>,
    prev_hash: Hash256,
    last_timestamp: u64,
    target_height: u32,
}

impl MemContext {
    fn bump_seq(&mut self, addr: Address) {
        let seq = self.accounts.entry(addr).or_insert(0);
        *seq += 1;
    }
}

impl Context for MemContext {
    fn snapshot(&mut self) -> u32 {
        self.snapshots.push(self.accounts.clone());
        self.snapshots.len() as u32
    }

    fn revert(&mut self, token: u32) {
        let token = token as usize;
        if token >= 1 && token <= self.snapshots.len() {
            self.accounts = self.snapshots[token - 1].clone();
            self.snapshots.truncate(token - 1);
        }
    }

    fn commit(&mut self, token: u32) {
        let token = token as usize;
        if token >= 1 && token <= self.snapshots.len() {
            self.snapshots.truncate(token - 1);
        }
    }

    fn seq(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).copied().unwrap_or(0)
    }

    fn prev_hash(&self) -> Hash256 {
        self.prev_hash
    }

    fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    fn target_height(&self) -> u32 {
        self.target_height
    }

    fn next_context(&self, prev_header_hash: Hash256, prev_timestamp: u64) -> Box<dyn Context> {
        Box::new(MemContext {
            accounts: self.accounts.clone(),
            snapshots: Vec::new(),
            prev_hash: prev_header_hash,
            last_timestamp: prev_timestamp,
            target_height: self.target_height + 1,
        })
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Block assembly over a [`MemContext`].
struct MemBlockCreator {
    chain_id: u8,
    version: u16,
    generator: Address,
    consensus_data: Vec<u8>,
    ctx: MemContext,
    tx_types: Vec<u16>,
    txs: Vec<Transaction>,
    tx_sigs: Vec<Vec<Signature>>,
}

impl BlockCreator for MemBlockCreator {
    fn unsafe_add_tx(
        &mut self,
        _generator: Address,
        tx_type: u16,
        _tx_hash: Hash256,
        tx: Transaction,
        signatures: Vec<Signature>,
        _signers: Vec<PublicHash>,
    ) -> Result<()> {
        if tx.seq != self.ctx.seq(&tx.from) + 1 {
            return Err(ChainError::InvalidSequence);
        }
        self.ctx.bump_seq(tx.from);
        self.tx_types.push(tx_type);
        self.txs.push(tx);
        self.tx_sigs.push(signatures);
        Ok(())
    }

    fn context_mut(&mut self) -> &mut dyn Context {
        &mut self.ctx
    }

    fn finalize(self: Box<Self>, timestamp: u64) -> Result<(Block, Box<dyn Context>)> {
        let count = self.txs.len();
        let header = Header {
            chain_id: self.chain_id,
            version: self.version,
            height: self.ctx.target_height,
            prev_hash: self.ctx.prev_hash,
            context_hash: state_digest(&self.ctx.accounts),
            timestamp,
            generator: self.generator,
            consensus_data: Bytes::from(self.consensus_data),
        };
        let block = Block {
            header,
            transaction_types: self.tx_types,
            transactions: self.txs,
            transaction_signatures: self.tx_sigs,
            transaction_results: vec![1u8; count],
            signatures: Vec::new(),
        };
        Ok((block, Box::new(self.ctx)))
    }
}

struct MemChainInner {
    blocks: Vec<Block>,
    accounts: HashMap<Address, u64>,
}

/// In-memory chain implementing the full collaborator seam.
pub struct MemChain {
    chain_id: u8,
    version: u16,
    inner: Mutex<MemChainInner>,
    closed: AtomicBool,
}

impl MemChain {
    /// Creates a chain holding only a genesis block.
    pub fn new(chain_id: u8, genesis_timestamp: u64) -> Self {
        let accounts = HashMap::new();
        let genesis = Block::empty(Header {
            chain_id,
            version: 1,
            height: 0,
            prev_hash: Hash256::NIL,
            context_hash: state_digest(&accounts),
            timestamp: genesis_timestamp,
            generator: Address::ZERO,
            consensus_data: Bytes::new(),
        });
        Self {
            chain_id,
            version: 1,
            inner: Mutex::new(MemChainInner {
                blocks: vec![genesis],
                accounts,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Committed sequence number of an account.
    pub fn account_seq(&self, addr: &Address) -> u64 {
        self.inner.lock().accounts.get(addr).copied().unwrap_or(0)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChainError::Closed);
        }
        Ok(())
    }

    fn validate_header(&self, inner: &MemChainInner, header: &Header) -> Result<()> {
        if header.chain_id != self.chain_id {
            return Err(ChainError::InvalidChainId);
        }
        let tip = inner.blocks.last().expect("genesis always present");
        let expected = tip.header.height + 1;
        if header.height != expected {
            return Err(ChainError::InvalidHeight {
                expected,
                actual: header.height,
            });
        }
        if header.prev_hash != tip.hash() {
            return Err(ChainError::InvalidPrevHash);
        }
        if header.timestamp <= tip.header.timestamp {
            return Err(ChainError::InvalidTimestamp);
        }
        Ok(())
    }
}

impl Provider for MemChain {
    fn chain_id(&self) -> u8 {
        self.chain_id
    }

    fn version(&self) -> u16 {
        self.version
    }

    fn height(&self) -> u32 {
        let inner = self.inner.lock();
        inner.blocks.last().expect("genesis always present").header.height
    }

    fn last_hash(&self) -> Hash256 {
        let inner = self.inner.lock();
        inner.blocks.last().expect("genesis always present").hash()
    }

    fn last_timestamp(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .blocks
            .last()
            .expect("genesis always present")
            .header
            .timestamp
    }

    fn last_status(&self) -> (u32, Hash256) {
        let inner = self.inner.lock();
        let tip = inner.blocks.last().expect("genesis always present");
        (tip.header.height, tip.hash())
    }

    fn hash(&self, height: u32) -> Result<Hash256> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(height as usize)
            .map(Block::hash)
            .ok_or(ChainError::NotFound(height))
    }

    fn block(&self, height: u32) -> Result<Block> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(height as usize)
            .cloned()
            .ok_or(ChainError::NotFound(height))
    }
}

impl Committer for MemChain {
    fn new_context(&self) -> Box<dyn Context> {
        let inner = self.inner.lock();
        let tip = inner.blocks.last().expect("genesis always present");
        Box::new(MemContext {
            accounts: inner.accounts.clone(),
            snapshots: Vec::new(),
            prev_hash: tip.hash(),
            last_timestamp: tip.header.timestamp,
            target_height: tip.header.height + 1,
        })
    }

    fn new_block_creator(
        &self,
        ctx: Box<dyn Context>,
        generator: Address,
        consensus_data: Vec<u8>,
    ) -> Result<Box<dyn BlockCreator>> {
        self.check_open()?;
        let ctx = ctx
            .into_any()
            .downcast::<MemContext>()
            .map_err(|_| ChainError::InvalidBlock("foreign context".into()))?;
        Ok(Box::new(MemBlockCreator {
            chain_id: self.chain_id,
            version: self.version,
            generator,
            consensus_data,
            ctx: *ctx,
            tx_types: Vec::new(),
            txs: Vec::new(),
            tx_sigs: Vec::new(),
        }))
    }

    fn connect_block(&self, block: &Block) -> Result<()> {
        self.check_open()?;
        block
            .validate_shape()
            .map_err(|e| ChainError::InvalidBlock(e.to_string()))?;

        let mut inner = self.inner.lock();
        self.validate_header(&inner, &block.header)?;

        let mut accounts = inner.accounts.clone();
        for tx in &block.transactions {
            let seq = accounts.entry(tx.from).or_insert(0);
            if tx.seq != *seq + 1 {
                return Err(ChainError::InvalidSequence);
            }
            *seq += 1;
        }
        inner.accounts = accounts;
        inner.blocks.push(block.clone());
        debug!(height = block.header.height, txs = block.transactions.len(), "block connected");
        Ok(())
    }

    fn connect_block_with_context(&self, block: &Block, ctx: Box<dyn Context>) -> Result<()> {
        self.check_open()?;
        block
            .validate_shape()
            .map_err(|e| ChainError::InvalidBlock(e.to_string()))?;
        let ctx = ctx
            .into_any()
            .downcast::<MemContext>()
            .map_err(|_| ChainError::InvalidBlock("foreign context".into()))?;

        let mut inner = self.inner.lock();
        self.validate_header(&inner, &block.header)?;
        inner.accounts = ctx.accounts;
        inner.blocks.push(block.clone());
        debug!(height = block.header.height, txs = block.transactions.len(), "block connected with context");
        Ok(())
    }
}

impl Chain for MemChain {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fixed formulator ranking table.
pub struct MemRank {
    ranks: Vec<Address>,
    produced: AtomicU32,
}

impl MemRank {
    /// Table with the given rank order (rank 0 first).
    pub fn new(ranks: Vec<Address>) -> Self {
        Self {
            ranks,
            produced: AtomicU32::new(0),
        }
    }

    /// Table where a single formulator holds rank 0.
    pub fn single(addr: Address) -> Self {
        Self::new(vec![addr])
    }

    /// Records how many blocks the current slot already produced.
    pub fn set_blocks_by_same_formulator(&self, count: u32) {
        self.produced.store(count, Ordering::SeqCst);
    }
}

impl FormulatorRank for MemRank {
    fn top_rank(&self, timeout_count: u32) -> Result<Address> {
        self.ranks
            .get(timeout_count as usize)
            .copied()
            .ok_or(ChainError::NoRankedFormulator(timeout_count))
    }

    fn blocks_by_same_formulator(&self) -> u32 {
        self.produced.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(from: u8, seq: u64, ts: u64) -> Transaction {
        Transaction::transfer(
            Address::new([from; 20]),
            Address::new([0xee; 20]),
            seq,
            5,
            ts,
        )
    }

    #[test]
    fn test_context_snapshot_revert_commit() {
        let mut ctx = MemContext {
            accounts: HashMap::new(),
            snapshots: Vec::new(),
            prev_hash: Hash256::NIL,
            last_timestamp: 1_000,
            target_height: 1,
        };
        let addr = Address::new([1u8; 20]);
        assert_eq!(ctx.seq(&addr), 0);

        let sn = ctx.snapshot();
        ctx.bump_seq(addr);
        assert_eq!(ctx.seq(&addr), 1);
        ctx.revert(sn);
        assert_eq!(ctx.seq(&addr), 0);

        let sn = ctx.snapshot();
        ctx.bump_seq(addr);
        ctx.commit(sn);
        assert_eq!(ctx.seq(&addr), 1);
    }

    #[test]
    fn test_block_creator_builds_linked_block() {
        let chain = MemChain::new(1, 1_000);
        let generator = Address::new([9u8; 20]);
        let ctx = chain.new_context();
        let mut bc = chain
            .new_block_creator(ctx, generator, vec![0, 0, 0, 0])
            .unwrap();

        let tx = transfer(1, 1, 2_000);
        bc.unsafe_add_tx(
            generator,
            0,
            tx.content_hash(),
            tx,
            vec![Signature::default()],
            vec![PublicHash::ZERO],
        )
        .unwrap();

        let (block, ctx) = bc.finalize(2_000).unwrap();
        assert_eq!(block.header.height, 1);
        assert_eq!(block.header.prev_hash, chain.hash(0).unwrap());
        assert_eq!(block.transactions.len(), 1);

        chain.connect_block_with_context(&block, ctx).unwrap();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.account_seq(&Address::new([1u8; 20])), 1);
    }

    #[test]
    fn test_creator_rejects_out_of_order_seq() {
        let chain = MemChain::new(1, 1_000);
        let generator = Address::new([9u8; 20]);
        let ctx = chain.new_context();
        let mut bc = chain.new_block_creator(ctx, generator, vec![]).unwrap();

        let tx = transfer(1, 3, 2_000);
        let err = bc
            .unsafe_add_tx(generator, 0, tx.content_hash(), tx, vec![], vec![])
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidSequence));
    }

    #[test]
    fn test_connect_block_validates_linkage() {
        let chain = MemChain::new(1, 1_000);
        let mut block = Block::empty(Header {
            chain_id: 1,
            version: 1,
            height: 1,
            prev_hash: Hash256::keccak256(b"wrong"),
            context_hash: Hash256::NIL,
            timestamp: 2_000,
            generator: Address::ZERO,
            consensus_data: Bytes::new(),
        });
        assert!(matches!(
            chain.connect_block(&block),
            Err(ChainError::InvalidPrevHash)
        ));

        block.header.prev_hash = chain.last_hash();
        block.header.timestamp = 500; // not after genesis
        assert!(matches!(
            chain.connect_block(&block),
            Err(ChainError::InvalidTimestamp)
        ));

        block.header.timestamp = 2_000;
        chain.connect_block(&block).unwrap();
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_closed_chain_rejects_connect() {
        let chain = MemChain::new(1, 1_000);
        chain.close();
        let block = Block::empty(Header {
            chain_id: 1,
            version: 1,
            height: 1,
            prev_hash: chain.last_hash(),
            context_hash: Hash256::NIL,
            timestamp: 2_000,
            generator: Address::ZERO,
            consensus_data: Bytes::new(),
        });
        assert!(matches!(chain.connect_block(&block), Err(ChainError::Closed)));
    }

    #[test]
    fn test_rank_table() {
        let a = Address::new([1u8; 20]);
        let b = Address::new([2u8; 20]);
        let rank = MemRank::new(vec![a, b]);
        assert_eq!(rank.top_rank(0).unwrap(), a);
        assert_eq!(rank.top_rank(1).unwrap(), b);
        assert!(rank.top_rank(2).is_err());

        rank.set_blocks_by_same_formulator(3);
        assert_eq!(rank.blocks_by_same_formulator(), 3);
    }
}
