//! The formulator node.
//!
//! Reacts to observer block requests by generating runs of consecutive
//! blocks, commits them as aggregated observer signatures return, advances
//! the tip from the block queue, and admits/gossips transactions through a
//! worker pool.
//!
//! ## Locking
//!
//! Round state sits behind one coarse mutex taken by every handler branch;
//! the generation loop releases it during pacing sleeps so signature
//! handling can commit concurrently. Status maps, the pool, the block queue
//! and the request timers each have their own finer lock and are never held
//! across an await.

use crate::block_queue::BlockQueue;
use crate::messages::{
    wire_type_id, BlockGenMessage, BlockObSignMessage, BlockReqMessage, PofMessage,
};
use crate::observer_mesh::{ObserverHandler, ObserverMesh};
use crate::status::StatusBoard;
use crate::{ConsensusError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pofcore_chain::{
    hash_transaction_by_type, Chain, ChainError, FormulatorRank,
};
use pofcore_crypto::ecdsa::{recover_public_hash, PrivateKey};
use pofcore_p2p::codec::encode_packet;
use pofcore_p2p::{
    BlockMessage, MeshHandler, MessageCodec, NodeMesh, NodePoolStore, Peer, RecvItem,
    RequestMessage, RequestTimer, SendItem, StatusMessage, TransactionMessage,
};
use pofcore_txpool::{ExpireQueue, PoolError, TransactionPool, TransactionValidator, MAX_POOL_SIZE};
use pofcore_types::{Address, Block, PublicHash, Signature, Transaction};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Nominal spacing between consecutive blocks in one slot.
const BLOCK_SPACING_NANOS: u64 = 500 * NANOS_PER_MILLI;

/// Window during which a repeated request for an already-generated height is
/// ignored.
const DUPLICATE_SUPPRESSION_NANOS: u64 = 30 * NANOS_PER_SEC;

/// If the round would start further than this ahead of wall time, spacing
/// collapses to 1 ms per block.
const GEN_AHEAD_LIMIT_NANOS: u64 = 3 * NANOS_PER_SEC;

/// Budget for draining the pool into one block.
const POOL_DRAIN_BUDGET: Duration = Duration::from_millis(600);

/// Delay before a future-height request is retried.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Retries allowed for a future-height request.
const MAX_REQ_RETRIES: u32 = 10;

/// Deadline on individual block-fetch requests.
const REQUEST_TTL: Duration = Duration::from_secs(2);

/// Blocks applied from the queue per 50 ms tick.
const MAX_APPLY_BATCH: u32 = 100;

/// Back-off when all queues are empty.
const QUEUE_IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// Cadence of the expire-queue sweep.
const EXPIRE_TICK: Duration = Duration::from_secs(1);

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}

/// Wall-clock offset at which block `i` of a run should have been emitted.
fn expected_elapsed(i: u32) -> Duration {
    if i < 7 {
        Duration::from_millis(500 * (i as u64 + 1))
    } else {
        Duration::from_millis(3_500 + 200 * (i as u64 - 6))
    }
}

/// Timestamp for block `i` of a run.
fn block_timestamp(
    start_block_time: u64,
    now: u64,
    no_delay: bool,
    i: u32,
    ctx_last_timestamp: u64,
) -> u64 {
    let mut timestamp = start_block_time;
    if no_delay || start_block_time > now + GEN_AHEAD_LIMIT_NANOS {
        timestamp += i as u64 * NANOS_PER_MILLI;
    } else {
        timestamp += i as u64 * BLOCK_SPACING_NANOS;
    }
    if timestamp <= ctx_last_timestamp {
        timestamp = ctx_last_timestamp + 1;
    }
    timestamp
}

/// Formulator configuration supplied by the embedder.
#[derive(Debug, Clone)]
pub struct FormulatorConfig {
    /// The address this node formulates as
    pub formulator_address: Address,
    /// Cap on transactions included per block
    pub max_transactions_per_block: usize,
    /// Cap on consecutive blocks per formulator slot
    pub max_blocks_per_formulator: u32,
}

impl FormulatorConfig {
    /// Config with the default caps (5000 transactions, 10 blocks).
    pub fn new(formulator_address: Address) -> Self {
        Self {
            formulator_address,
            max_transactions_per_block: 5_000,
            max_blocks_per_formulator: 10,
        }
    }
}

/// Round state: everything between a request accept and the final commit.
#[derive(Default)]
struct RoundState {
    last_req: Option<BlockReqMessage>,
    last_gen: Vec<BlockGenMessage>,
    last_ctx: Vec<Box<dyn pofcore_chain::Context>>,
    sign_map: HashMap<u32, BlockObSignMessage>,
    last_gen_height: u32,
    last_gen_time: u64,
}

struct RetryEntry {
    due: Instant,
    peer: PublicHash,
    msg: BlockReqMessage,
    retry: u32,
}

struct TxWorkItem {
    msg: TransactionMessage,
    sender: Option<PublicHash>,
    reply: oneshot::Sender<Result<()>>,
}

struct Receivers {
    recv: Vec<mpsc::UnboundedReceiver<RecvItem<PofMessage>>>,
    send: Vec<mpsc::UnboundedReceiver<SendItem>>,
}

struct FormulatorInner {
    config: FormulatorConfig,
    chain: Arc<dyn Chain>,
    rank: Arc<dyn FormulatorRank>,
    validator: Arc<dyn TransactionValidator>,
    key: PrivateKey,
    round: Mutex<RoundState>,
    gen_lock: tokio::sync::Mutex<()>,
    request_lock: Mutex<()>,
    status: StatusBoard,
    txpool: TransactionPool,
    txq: Mutex<ExpireQueue<TransactionMessage>>,
    block_queue: Mutex<BlockQueue>,
    observer_timer: Arc<RequestTimer>,
    node_timer: Arc<RequestTimer>,
    obs_mesh: Arc<ObserverMesh>,
    node_mesh: Arc<NodeMesh<PofMessage>>,
    recv_txs: Vec<mpsc::UnboundedSender<RecvItem<PofMessage>>>,
    send_txs: Vec<mpsc::UnboundedSender<SendItem>>,
    receivers: Mutex<Option<Receivers>>,
    retries: Mutex<Vec<RetryEntry>>,
    workers: OnceLock<Vec<mpsc::UnboundedSender<TxWorkItem>>>,
    tx_msg_idx: AtomicU64,
    closed: AtomicBool,
    running: AtomicBool,
}

/// The formulator node.
///
/// Owns the round state machine, both meshes, the transaction pool and the
/// tip advancement loops. Entry points: [`FormulatorNode::init`],
/// [`FormulatorNode::run`], [`FormulatorNode::add_tx`],
/// [`FormulatorNode::close`].
pub struct FormulatorNode {
    inner: Arc<FormulatorInner>,
}

impl FormulatorNode {
    /// Wires a formulator node.
    ///
    /// `key` signs block headers and authenticates to observers; `node_key`
    /// is the node-mesh identity. `observer_addresses` maps each observer's
    /// public hash to its network address and is fixed for the node's
    /// lifetime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FormulatorConfig,
        key: PrivateKey,
        node_key: PrivateKey,
        observer_addresses: HashMap<PublicHash, String>,
        seed_addresses: HashMap<PublicHash, String>,
        chain: Arc<dyn Chain>,
        rank: Arc<dyn FormulatorRank>,
        validator: Arc<dyn TransactionValidator>,
        store: Arc<dyn NodePoolStore>,
    ) -> Self {
        let codec: Arc<MessageCodec<PofMessage>> = Arc::new(crate::messages::build_codec());
        let chain_id = chain.chain_id();

        let mut recv_txs = Vec::with_capacity(4);
        let mut recv_rxs = Vec::with_capacity(4);
        for _ in 0..4 {
            let (tx, rx) = mpsc::unbounded_channel();
            recv_txs.push(tx);
            recv_rxs.push(rx);
        }
        let mut send_txs = Vec::with_capacity(3);
        let mut send_rxs = Vec::with_capacity(3);
        for _ in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            send_txs.push(tx);
            send_rxs.push(rx);
        }

        let inner = Arc::new_cyclic(|weak: &Weak<FormulatorInner>| {
            let observer_handler: Weak<dyn ObserverHandler> = weak.clone();
            let mesh_handler: Weak<dyn MeshHandler<PofMessage>> = weak.clone();

            let obs_mesh = Arc::new(ObserverMesh::new(
                chain_id,
                key.clone(),
                config.formulator_address,
                observer_addresses,
                observer_handler,
                codec.clone(),
            ));
            let node_mesh = Arc::new(NodeMesh::new(
                chain_id,
                node_key,
                seed_addresses,
                mesh_handler,
                codec.clone(),
                store,
            ));

            FormulatorInner {
                config,
                chain,
                rank,
                validator,
                key,
                round: Mutex::new(RoundState::default()),
                gen_lock: tokio::sync::Mutex::new(()),
                request_lock: Mutex::new(()),
                status: StatusBoard::new(),
                txpool: TransactionPool::new(),
                txq: Mutex::new(ExpireQueue::with_default_tiers()),
                block_queue: Mutex::new(BlockQueue::new()),
                observer_timer: Arc::new(RequestTimer::new()),
                node_timer: Arc::new(RequestTimer::new()),
                obs_mesh,
                node_mesh,
                recv_txs,
                send_txs,
                receivers: Mutex::new(Some(Receivers {
                    recv: recv_rxs,
                    send: send_rxs,
                })),
                retries: Mutex::new(Vec::new()),
                workers: OnceLock::new(),
                tx_msg_idx: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }
        });

        Self { inner }
    }

    /// Validates the wiring before the node runs.
    pub fn init(&self) -> Result<()> {
        if self.inner.config.formulator_address.is_zero() {
            return Err(ConsensusError::InvalidRequest);
        }
        if self.inner.config.max_blocks_per_formulator == 0 {
            return Err(ConsensusError::InvalidRequest);
        }
        Ok(())
    }

    /// Runs the node: meshes, timers, workers, drains and the tip loops.
    ///
    /// Returns when [`FormulatorNode::close`] is called.
    pub async fn run(&self, bind_address: &str) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = &self.inner;

        inner.obs_mesh.run();
        inner.node_mesh.run(bind_address.to_string()).await?;

        let (expired_tx, mut expired_rx) = mpsc::unbounded_channel();
        tokio::spawn(inner.observer_timer.clone().run(expired_tx.clone()));
        tokio::spawn(inner.node_timer.clone().run(expired_tx));
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                while expired_rx.recv().await.is_some() {
                    inner.try_request_blocks();
                }
            });
        }

        inner.spawn_workers();

        let receivers = inner
            .receivers
            .lock()
            .take()
            .expect("run may only consume the queues once");
        tokio::spawn(recv_drain(inner.clone(), receivers.recv));
        tokio::spawn(send_drain(inner.clone(), receivers.send));
        tokio::spawn(expire_loop(inner.clone()));

        info!(formulator = %inner.config.formulator_address, "formulator running");

        let mut block_tick = interval(Duration::from_millis(50));
        block_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut request_tick = interval(Duration::from_millis(500));
        request_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if inner.is_closed() {
                return Ok(());
            }
            tokio::select! {
                _ = block_tick.tick() => {
                    inner.process_retries();
                    inner.process_block_queue();
                }
                _ = request_tick.tick() => {
                    inner.try_request_blocks();
                    inner.try_request_next();
                }
            }
        }
    }

    /// Admits a locally submitted transaction and gossips it.
    pub fn add_tx(&self, tx_type: u16, tx: Transaction, sigs: Vec<Signature>) -> Result<()> {
        self.inner
            .add_tx_internal(tx_type, tx.clone(), sigs.clone())?;
        let msg = TransactionMessage { tx_type, tx, sigs };
        if let Ok(packet) = encode_packet(&msg) {
            let _ = self.inner.send_txs[1].send(SendItem::limited(packet, 3));
        }
        Ok(())
    }

    /// Number of pooled transactions.
    pub fn pool_size(&self) -> usize {
        self.inner.txpool.size()
    }

    /// Shuts the node down: closes the chain provider and drops all peers.
    /// Loops observe the flag at their next iteration; outbound queues are
    /// not drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.chain.close();
        self.inner.obs_mesh.close();
        self.inner.node_mesh.close();
    }
}

impl FormulatorInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn spawn_workers(self: &Arc<Self>) {
        let count = std::cmp::max(1, num_cpus::get().saturating_sub(1));
        let mut senders = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            tokio::spawn(worker_loop(self.clone(), rx));
        }
        let _ = self.workers.set(senders);
    }

    // -- Transaction admission --

    fn add_tx_internal(&self, tx_type: u16, tx: Transaction, sigs: Vec<Signature>) -> Result<()> {
        if self.txpool.size() > MAX_POOL_SIZE {
            return Err(PoolError::TransactionPoolOverflowed.into());
        }
        let tx_hash = hash_transaction_by_type(self.chain.chain_id(), tx_type, &tx);
        if self.txpool.is_exist(&tx_hash) {
            return Err(PoolError::ExistTransaction.into());
        }

        let ctx = self.chain.new_context();
        let seq = ctx.seq(&tx.from);
        if tx.seq <= seq {
            return Err(PoolError::PastSeq.into());
        }
        if tx.seq > seq + 100 {
            return Err(PoolError::TooFarSeq.into());
        }

        let mut signers = Vec::with_capacity(sigs.len());
        for sig in &sigs {
            let signer = recover_public_hash(&tx_hash, sig)
                .map_err(|e| PoolError::InvalidSignature(e.to_string()))?;
            signers.push(signer);
        }
        self.validator.validate(&tx, &*ctx, &signers)?;

        self.txpool
            .push(tx_type, tx_hash, tx.clone(), sigs.clone(), signers)?;
        self.txq
            .lock()
            .push(tx_hash, TransactionMessage { tx_type, tx, sigs });
        Ok(())
    }

    async fn dispatch_tx(&self, sender: PublicHash, msg: TransactionMessage) -> Result<()> {
        let Some(workers) = self.workers.get() else {
            return Ok(());
        };
        let idx = (self.tx_msg_idx.fetch_add(1, Ordering::Relaxed) as usize) % workers.len();
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = TxWorkItem {
            msg,
            sender: Some(sender),
            reply: reply_tx,
        };
        if workers[idx].send(item).is_err() {
            return Ok(());
        }
        match reply_rx.await {
            Ok(Err(e)) => {
                if let ConsensusError::Pool(pool_err) = &e {
                    if pool_err.is_swallowed() {
                        return Ok(());
                    }
                }
                Err(e)
            }
            _ => Ok(()),
        }
    }

    fn clean_pool(&self, block: &Block) {
        let chain_id = self.chain.chain_id();
        let mut txq = self.txq.lock();
        for (tx, tx_type) in block.transactions.iter().zip(&block.transaction_types) {
            let tx_hash = hash_transaction_by_type(chain_id, *tx_type, tx);
            self.txpool.remove(&tx_hash);
            txq.remove(&tx_hash);
        }
    }

    // -- Round driver --

    fn handle_block_req(
        self: &Arc<Self>,
        observer: PublicHash,
        msg: BlockReqMessage,
        retry: u32,
    ) -> Result<()> {
        let mut round = self.round.lock();
        let height = self.chain.height();
        let now = now_nanos();

        if msg.target_height <= round.last_gen_height
            && round.last_gen_time + DUPLICATE_SUPPRESSION_NANOS > now
        {
            return Ok(());
        }
        if let Some(last_req) = &round.last_req {
            if msg.target_height <= last_req.target_height {
                return Ok(());
            }
        }
        if msg.target_height <= height {
            return Ok(());
        }
        if msg.target_height > height + 1 {
            if retry >= MAX_REQ_RETRIES {
                return Ok(());
            }
            if retry == 0 {
                let count = (msg.target_height - height - 1).min(10) as u8;
                self.obs_mesh.send_to(
                    observer,
                    &RequestMessage {
                        height: height + 1,
                        count,
                    },
                )?;
            }
            drop(round);
            self.retries.lock().push(RetryEntry {
                due: Instant::now() + RETRY_DELAY,
                peer: observer,
                msg,
                retry: retry + 1,
            });
            return Ok(());
        }

        let top = self.rank.top_rank(msg.timeout_count)?;
        if msg.formulator != top {
            return Err(ConsensusError::InvalidRequest);
        }
        if msg.formulator != self.config.formulator_address {
            return Err(ConsensusError::InvalidRequest);
        }
        if msg.formulator_public_hash != self.key.public_key().public_hash() {
            return Err(ConsensusError::InvalidRequest);
        }
        if msg.prev_hash != self.chain.last_hash() {
            return Err(ConsensusError::InvalidRequest);
        }
        if msg.target_height != height + 1 {
            return Err(ConsensusError::InvalidRequest);
        }

        round.last_req = Some(msg.clone());
        drop(round);

        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.gen_block(observer, msg).await {
                warn!(error = %e, "block generation aborted");
            }
        });
        Ok(())
    }

    async fn gen_block(self: Arc<Self>, observer: PublicHash, req: BlockReqMessage) -> Result<()> {
        let _gen = self.gen_lock.lock().await;
        {
            let mut round = self.round.lock();
            round.last_gen.clear();
            round.last_ctx.clear();
            round.sign_map.clear();
        }

        let start = Instant::now();
        let now = now_nanos();
        let mut no_delay = false;

        let max_blocks = self.config.max_blocks_per_formulator;
        let remain = if req.timeout_count > 0 {
            max_blocks
        } else {
            max_blocks.saturating_sub(self.rank.blocks_by_same_formulator())
        };
        if remain == 0 {
            return Ok(());
        }

        let last_timestamp = self.chain.last_timestamp();
        let mut start_block_time = now;
        if start_block_time < last_timestamp {
            start_block_time = last_timestamp + NANOS_PER_MILLI;
        } else if start_block_time > last_timestamp + remain as u64 * BLOCK_SPACING_NANOS {
            no_delay = true;
        }

        let mut next_ctx: Option<Box<dyn pofcore_chain::Context>> = None;
        for i in 0..remain {
            if self.is_closed() {
                return Err(ConsensusError::Closed);
            }
            {
                let mut round = self.round.lock();
                let timeout_count = if i == 0 { req.timeout_count } else { 0 };
                let ctx = match next_ctx.take() {
                    None => self.chain.new_context(),
                    Some(ctx) => ctx,
                };
                let timestamp =
                    block_timestamp(start_block_time, now, no_delay, i, ctx.last_timestamp());

                let consensus_data = timeout_count.to_le_bytes().to_vec();
                let mut creator =
                    self.chain
                        .new_block_creator(ctx, req.formulator, consensus_data)?;

                {
                    let mut locked = self.txpool.lock();
                    let deadline = Instant::now() + POOL_DRAIN_BUDGET;
                    let mut count = 0usize;
                    while Instant::now() < deadline {
                        let ctx_ref = creator.context_mut();
                        let token = ctx_ref.snapshot();
                        let item = locked.unsafe_pop(&*ctx_ref);
                        creator.context_mut().revert(token);
                        let Some(item) = item else { break };
                        if creator
                            .unsafe_add_tx(
                                self.config.formulator_address,
                                item.tx_type,
                                item.tx_hash,
                                item.transaction,
                                item.signatures,
                                item.signers,
                            )
                            .is_err()
                        {
                            continue;
                        }
                        count += 1;
                        if count >= self.config.max_transactions_per_block {
                            break;
                        }
                    }
                }

                let (block, ctx) = creator.finalize(timestamp)?;
                let header = block.header.clone();
                let generator_signature = self.key.sign(&header.hash())?;
                let gen = BlockGenMessage {
                    block,
                    generator_signature,
                    is_reply: false,
                };
                self.obs_mesh.send_to(observer, &gen)?;
                info!(
                    height = header.height,
                    txs = gen.block.transactions.len(),
                    "block generated"
                );

                next_ctx = Some(ctx.next_context(header.hash(), header.timestamp));
                round.last_gen.push(gen);
                round.last_ctx.push(ctx);
                round.last_gen_height = header.height;
                round.last_gen_time = now_nanos();
            }

            let expected = expected_elapsed(i);
            let elapsed = start.elapsed();
            if !no_delay && expected > elapsed {
                sleep(expected - elapsed).await;
            }
        }
        Ok(())
    }

    fn handle_ob_sign(&self, observer: PublicHash, msg: BlockObSignMessage) -> Result<()> {
        let mut round = self.round.lock();
        let target = self.chain.height() + 1;
        if msg.target_height < target {
            return Ok(());
        }
        let Some(last_req) = &round.last_req else {
            return Ok(());
        };
        if msg.target_height >= last_req.target_height + 10 {
            return Err(ConsensusError::InvalidRequest);
        }
        round.sign_map.insert(msg.target_height, msg);

        // One target per message: after a commit the next head is above it
        // and the drain stops until the following signature arrives.
        loop {
            let Some(head) = round.last_gen.first() else {
                break;
            };
            let head_height = head.block.header.height;
            if head_height < target {
                // Already applied through another path; discard the stale
                // head without re-checking it against the committed block.
                round.last_gen.remove(0);
                round.last_ctx.remove(0);
                continue;
            }
            if head_height > target {
                break;
            }
            let Some(sign) = round.sign_map.get(&head_height) else {
                break;
            };
            if sign.block_sign.header_hash != head.block.header.hash() {
                return Err(ConsensusError::InvalidRequest);
            }

            let gen = round.last_gen.remove(0);
            let ctx = round.last_ctx.remove(0);
            let sign = round
                .sign_map
                .remove(&head_height)
                .expect("presence checked above");

            let mut block = gen.block;
            let mut signatures = Vec::with_capacity(1 + sign.observer_signatures.len());
            signatures.push(gen.generator_signature);
            signatures.extend(sign.observer_signatures);
            block.signatures = signatures;

            self.chain.connect_block_with_context(&block, ctx)?;
            info!(
                height = block.header.height,
                txs = block.transactions.len(),
                "block committed"
            );
            self.broadcast_status();
            self.clean_pool(&block);
            self.status.raise_observer_height(&observer, head_height);
        }
        Ok(())
    }

    fn process_retries(self: &Arc<Self>) {
        let due: Vec<RetryEntry> = {
            let mut retries = self.retries.lock();
            let now = Instant::now();
            let mut due = Vec::new();
            let mut i = 0;
            while i < retries.len() {
                if retries[i].due <= now {
                    due.push(retries.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            due
        };
        for entry in due {
            match self.handle_block_req(entry.peer, entry.msg, entry.retry) {
                Ok(()) | Err(ConsensusError::InvalidRequest) => {}
                Err(e) => debug!(error = %e, "request retry failed"),
            }
        }
    }

    // -- Tip advancement --

    fn process_block_queue(&self) {
        let mut connected = false;
        {
            let _round = self.round.lock();
            let mut target = self.chain.height() + 1;
            let mut count = 0;
            loop {
                let block = { self.block_queue.lock().pop_exact(target) };
                let Some(block) = block else { break };
                if let Err(e) = self.chain.connect_block(&block) {
                    debug!(height = target, error = %e, "connect failed, stopping batch");
                    break;
                }
                info!(
                    height = block.header.height,
                    txs = block.transactions.len(),
                    "block connected"
                );
                self.clean_pool(&block);
                connected = true;
                count += 1;
                if count >= MAX_APPLY_BATCH {
                    break;
                }
                target += 1;
            }
        }
        if connected {
            self.broadcast_status();
            self.try_request_blocks();
        }
    }

    fn broadcast_status(&self) {
        let (height, last_hash) = self.chain.last_status();
        let msg = StatusMessage {
            version: self.chain.version(),
            height,
            last_hash,
        };
        if let Ok(packet) = encode_packet(&msg) {
            let _ = self.send_txs[0].send(SendItem::broadcast(packet));
        }
        let _ = self.obs_mesh.broadcast(&msg);
    }

    fn try_request_blocks(&self) {
        let _guard = self.request_lock.lock();
        let height = self.chain.height();
        for q in 0..10u32 {
            let base = height + q * 10;
            let Some((target, limit)) = self.status.select_node_peer(base) else {
                break;
            };
            let top = (base + 10).min(limit);
            let mut enable = 0;
            for i in base + 1..=top {
                if !self.node_timer.exist(i) {
                    enable += 1;
                }
            }
            if enable == 10 {
                self.send_request_to_node(target, base + 1, 10);
            } else if enable > 0 {
                for i in base + 1..=top {
                    if !self.node_timer.exist(i) {
                        self.send_request_to_node(target, i, 1);
                    }
                }
            }
        }
    }

    fn try_request_next(&self) {
        let _guard = self.request_lock.lock();
        let target = self.chain.height() + 1;
        if self.observer_timer.exist(target) {
            return;
        }
        if self.block_queue.lock().find(target).is_some() {
            return;
        }
        if let Some(observer) = self.status.select_observer_peer(target) {
            self.send_request_to_observer(observer, target, 1);
        }
    }

    fn send_request_to_node(&self, target: PublicHash, height: u32, count: u8) {
        let msg = RequestMessage { height, count };
        if let Ok(packet) = encode_packet(&msg) {
            let _ = self.send_txs[0].send(SendItem::to(target, packet));
        }
        for h in height..height + count as u32 {
            self.node_timer.add(h, REQUEST_TTL, target);
        }
    }

    fn send_request_to_observer(&self, observer: PublicHash, height: u32, count: u8) {
        let msg = RequestMessage { height, count };
        if self.obs_mesh.send_to(observer, &msg).is_ok() {
            for h in height..height + count as u32 {
                self.observer_timer.add(h, REQUEST_TTL, observer);
            }
        }
    }

    // -- Inbound blocks --

    fn add_block(&self, block: Block) -> Result<()> {
        let height = block.header.height;
        if height <= self.chain.height() {
            let known = self.chain.hash(height)?;
            if known != block.header.hash() {
                return Err(ChainError::FoundForkedBlock.into());
            }
        } else {
            let mut queue = self.block_queue.lock();
            if let Some(existing) = queue.find(height) {
                if existing.header.hash() != block.header.hash() {
                    return Err(ChainError::FoundForkedBlock.into());
                }
            } else {
                queue.find_or_insert(block);
            }
        }
        Ok(())
    }

    fn serve_blocks(&self, height: u32, count: u8) -> Result<Option<BlockMessage>> {
        let count = count.clamp(1, 10);
        let tip = self.chain.height();
        if height > tip {
            return Ok(None);
        }
        let mut blocks = Vec::with_capacity(count as usize);
        for i in 0..count as u32 {
            let h = height + i;
            if h > tip {
                break;
            }
            blocks.push(self.chain.block(h)?);
        }
        Ok(Some(BlockMessage { blocks }))
    }

    // -- Message dispatch --

    async fn handle_observer_message(
        self: &Arc<Self>,
        observer: PublicHash,
        message: PofMessage,
        retry: u32,
    ) -> Result<()> {
        match message {
            PofMessage::BlockReq(msg) => self.handle_block_req(observer, msg, retry),
            PofMessage::BlockObSign(msg) => self.handle_ob_sign(observer, msg),
            PofMessage::Request(msg) => {
                if let Some(reply) = self.serve_blocks(msg.height, msg.count)? {
                    self.obs_mesh.send_to(observer, &reply)?;
                }
                Ok(())
            }
            PofMessage::Block(msg) => {
                let last_height = msg.blocks.last().map(|b| b.header.height);
                for block in msg.blocks {
                    self.add_block(block)?;
                }
                if let Some(height) = last_height {
                    self.status.raise_observer_height(&observer, height);
                    self.try_request_next();
                }
                Ok(())
            }
            PofMessage::Status(msg) => {
                self.status.update_observer(&observer, &msg);
                let mut target = self.chain.height() + 1;
                while target <= msg.height {
                    if !self.observer_timer.exist(target)
                        && self.block_queue.lock().find(target).is_none()
                    {
                        self.send_request_to_observer(observer, target, 1);
                    }
                    target += 1;
                }
                Ok(())
            }
            PofMessage::Transaction(msg) => self.dispatch_tx(observer, msg).await,
            other => Err(pofcore_p2p::P2pError::UnknownMessage(wire_type_id(&other)).into()),
        }
    }

    async fn handle_peer_message(
        self: &Arc<Self>,
        peer: PublicHash,
        message: PofMessage,
    ) -> Result<()> {
        match message {
            PofMessage::Request(msg) => {
                if let Some(reply) = self.serve_blocks(msg.height, msg.count)? {
                    let served = reply.blocks.len() as u32;
                    if let Ok(packet) = encode_packet(&reply) {
                        let _ = self.send_txs[0].send(SendItem::to(peer, packet));
                    }
                    if served > 0 {
                        // The peer will hold these once delivered.
                        if let Some(p) = self.node_mesh.get_peer(&peer) {
                            p.update_guess_height(msg.height + served - 1);
                        }
                    }
                }
                Ok(())
            }
            PofMessage::Status(msg) => {
                self.status.update_node(&peer, &msg);
                let height = self.chain.height();
                if height < msg.height {
                    for q in 0..10u32 {
                        let base = height + q * 10;
                        if base > msg.height {
                            break;
                        }
                        let top = (base + 10).min(msg.height);
                        let mut enable = 0;
                        for i in base + 1..=top {
                            if !self.node_timer.exist(i) {
                                enable += 1;
                            }
                        }
                        if enable == 10 {
                            self.send_request_to_node(peer, base + 1, 10);
                        } else if enable > 0 {
                            for i in base + 1..=top {
                                if !self.node_timer.exist(i) {
                                    self.send_request_to_node(peer, i, 1);
                                }
                            }
                        }
                    }
                } else {
                    let known = self.chain.hash(msg.height)?;
                    if known != msg.last_hash {
                        warn!(peer = %peer, height = msg.height, "status conflicts with committed chain, dropping peer");
                        self.node_mesh.remove_peer(&peer);
                    }
                }
                Ok(())
            }
            PofMessage::Block(msg) => {
                let last_height = msg.blocks.last().map(|b| b.header.height);
                for block in msg.blocks {
                    self.add_block(block)?;
                }
                if let Some(height) = last_height {
                    self.status.raise_node_height(&peer, height);
                }
                Ok(())
            }
            PofMessage::Transaction(msg) => self.dispatch_tx(peer, msg).await,
            PofMessage::PeerList(msg) => {
                self.node_mesh.add_peer_list(msg.ips, msg.hashes);
                Ok(())
            }
            PofMessage::RequestPeerList(_) => {
                let _ = self.node_mesh.send_peer_list(peer);
                Ok(())
            }
            other => Err(pofcore_p2p::P2pError::UnknownMessage(wire_type_id(&other)).into()),
        }
    }

    async fn process_observer_item(self: &Arc<Self>, item: RecvItem<PofMessage>) {
        match self
            .handle_observer_message(item.peer, item.message, 0)
            .await
        {
            Ok(()) => {}
            Err(ConsensusError::InvalidRequest) => {
                warn!(observer = %item.peer, "invalid observer request discarded");
            }
            Err(e) => {
                warn!(observer = %item.peer, error = %e, "observer message failed, dropping peer");
                self.obs_mesh.remove_peer(&item.peer);
            }
        }
    }

    async fn process_node_item(self: &Arc<Self>, item: RecvItem<PofMessage>) {
        if let Err(e) = self.handle_peer_message(item.peer, item.message).await {
            warn!(peer = %item.peer, error = %e, "peer message failed, dropping peer");
            self.node_mesh.remove_peer(&item.peer);
        }
    }

    fn transmit(&self, item: SendItem) {
        match (item.target, item.limit) {
            (None, 0) => self.node_mesh.broadcast_packet(item.packet),
            (None, limit) => self.node_mesh.except_cast_limit(None, item.packet, limit),
            (Some(target), 0) => {
                let _ = self.node_mesh.send_packet_to(target, item.packet);
            }
            (Some(except), limit) => {
                self.node_mesh
                    .except_cast_limit(Some(except), item.packet, limit)
            }
        }
    }
}

async fn worker_loop(inner: Arc<FormulatorInner>, mut rx: mpsc::UnboundedReceiver<TxWorkItem>) {
    while let Some(item) = rx.recv().await {
        let result =
            inner.add_tx_internal(item.msg.tx_type, item.msg.tx.clone(), item.msg.sigs.clone());
        if result.is_ok() {
            if let Some(sender) = item.sender {
                if let Ok(packet) = encode_packet(&item.msg) {
                    let _ = inner.send_txs[1].send(SendItem::limited_except(sender, packet, 3));
                }
            }
        }
        let _ = item.reply.send(result);
    }
}

async fn recv_drain(
    inner: Arc<FormulatorInner>,
    mut queues: Vec<mpsc::UnboundedReceiver<RecvItem<PofMessage>>>,
) {
    loop {
        if inner.is_closed() {
            return;
        }
        loop {
            let mut item: Option<(usize, RecvItem<PofMessage>)> = None;
            for (idx, rx) in queues.iter_mut().enumerate() {
                if let Ok(found) = rx.try_recv() {
                    item = Some((idx, found));
                    break;
                }
            }
            let Some((idx, item)) = item else { break };
            if idx == 0 {
                inner.process_observer_item(item).await;
            } else {
                inner.process_node_item(item).await;
            }
        }
        sleep(QUEUE_IDLE_BACKOFF).await;
    }
}

async fn send_drain(inner: Arc<FormulatorInner>, mut queues: Vec<mpsc::UnboundedReceiver<SendItem>>) {
    loop {
        if inner.is_closed() {
            return;
        }
        loop {
            let mut item: Option<SendItem> = None;
            for rx in queues.iter_mut() {
                if let Ok(found) = rx.try_recv() {
                    item = Some(found);
                    break;
                }
            }
            let Some(item) = item else { break };
            inner.transmit(item);
        }
        sleep(QUEUE_IDLE_BACKOFF).await;
    }
}

async fn expire_loop(inner: Arc<FormulatorInner>) {
    let mut ticker = interval(EXPIRE_TICK);
    loop {
        ticker.tick().await;
        if inner.is_closed() {
            return;
        }
        let expired = inner.txq.lock().pop_expired(Instant::now());
        for entry in expired {
            if let Ok(packet) = encode_packet(&entry.value) {
                let _ = inner.send_txs[1].send(SendItem::limited(packet, 3));
            }
            if entry.is_last {
                inner.txpool.remove(&entry.key);
            }
        }
    }
}

#[async_trait]
impl MeshHandler<PofMessage> for FormulatorInner {
    async fn on_connected(&self, peer: Arc<Peer>) {
        self.status.node_connected(peer.id());
        let _ = self.node_mesh.request_peer_list(peer.id());
    }

    async fn on_disconnected(&self, peer: Arc<Peer>) {
        self.status.node_disconnected(&peer.id());
        self.node_timer.removes_by_value(&peer.id());
        self.try_request_blocks();
    }

    async fn on_recv(&self, peer: Arc<Peer>, message: PofMessage) -> pofcore_p2p::Result<()> {
        let idx = match &message {
            PofMessage::Request(_) | PofMessage::Status(_) | PofMessage::Block(_) => 1,
            PofMessage::Transaction(_) => 2,
            PofMessage::PeerList(_) | PofMessage::RequestPeerList(_) => 3,
            PofMessage::Ping(_) => return Ok(()),
            other => {
                return Err(pofcore_p2p::P2pError::UnknownMessage(wire_type_id(other)));
            }
        };
        let _ = self.recv_txs[idx].send(RecvItem {
            peer: peer.id(),
            message,
        });
        Ok(())
    }
}

#[async_trait]
impl ObserverHandler for FormulatorInner {
    async fn on_observer_connected(&self, peer: Arc<Peer>) {
        self.status.observer_connected(peer.id());
        let (height, last_hash) = self.chain.last_status();
        let msg = StatusMessage {
            version: self.chain.version(),
            height,
            last_hash,
        };
        if let Ok(packet) = encode_packet(&msg) {
            let _ = peer.send_packet(packet);
        }
    }

    async fn on_observer_disconnected(&self, peer: Arc<Peer>) {
        self.status.observer_disconnected(&peer.id());
        self.observer_timer.removes_by_value(&peer.id());
        self.try_request_next();
    }

    async fn on_observer_recv(&self, peer: Arc<Peer>, message: PofMessage) -> Result<()> {
        let _ = self.recv_txs[0].send(RecvItem {
            peer: peer.id(),
            message,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = FormulatorConfig::new(Address::new([1u8; 20]));
        assert_eq!(config.max_transactions_per_block, 5_000);
        assert_eq!(config.max_blocks_per_formulator, 10);
    }

    #[test]
    fn test_expected_elapsed_schedule() {
        assert_eq!(expected_elapsed(0), Duration::from_millis(500));
        assert_eq!(expected_elapsed(6), Duration::from_millis(3_500));
        assert_eq!(expected_elapsed(7), Duration::from_millis(3_700));
        assert_eq!(expected_elapsed(9), Duration::from_millis(4_100));
    }

    #[test]
    fn test_block_timestamp_spacing() {
        let base = 1_000 * NANOS_PER_SEC;
        // Normal pacing: 500 ms per block.
        assert_eq!(
            block_timestamp(base, base, false, 2, 0),
            base + 2 * BLOCK_SPACING_NANOS
        );
        // No-delay mode: 1 ms per block.
        assert_eq!(
            block_timestamp(base, base, true, 2, 0),
            base + 2 * NANOS_PER_MILLI
        );
        // Running ahead of wall time also collapses the spacing.
        let ahead = base + GEN_AHEAD_LIMIT_NANOS + 1;
        assert_eq!(
            block_timestamp(ahead, base, false, 2, 0),
            ahead + 2 * NANOS_PER_MILLI
        );
    }

    #[test]
    fn test_block_timestamp_always_advances() {
        let base = 1_000 * NANOS_PER_SEC;
        let last = base + 10 * BLOCK_SPACING_NANOS;
        assert_eq!(block_timestamp(base, base, false, 0, last), last + 1);
    }
}
