//! End-to-end round tests: a scripted observer drives a running formulator
//! over loopback TCP through request, generation, co-signing and commit.

use pofcore_chain::{hash_transaction_by_type, Chain, MemChain, MemRank, Provider};
use pofcore_consensus::{
    build_codec, BlockObSignMessage, BlockReqMessage, FormulatorConfig, FormulatorNode, PofMessage,
};
use pofcore_crypto::ecdsa::{recover_public_hash, PrivateKey};
use pofcore_p2p::codec::encode_packet;
use pofcore_p2p::{handshake, MemoryNodeStore, MessageCodec, Peer, PeerReader, PingMessage, WireMessage};
use pofcore_txpool::AcceptAllValidator;
use pofcore_types::{Address, BlockSign, Hash256, Signature, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}

/// A scripted observer endpoint: accepts the formulator's dial, completes
/// the handshake and then speaks raw PoF frames.
struct FakeObserver {
    peer: Arc<Peer>,
    reader: PeerReader,
    codec: MessageCodec<PofMessage>,
}

impl FakeObserver {
    async fn accept(listener: &TcpListener, key: &PrivateKey, chain_id: u8) -> (Self, Address) {
        let (mut stream, _) = listener.accept().await.unwrap();

        // The formulator answers our challenge first, then proves itself
        // with its address bound into its own challenge.
        let formulator_pub = handshake::issue_challenge(&mut stream, chain_id, &[])
            .await
            .unwrap();
        let extra = handshake::answer_challenge(&mut stream, key, chain_id, 20)
            .await
            .unwrap();
        let formulator_address = Address::from_slice(&extra).unwrap();
        assert!(!formulator_pub.is_zero());

        let (peer, reader) = Peer::spawn(
            stream,
            formulator_pub,
            "formulator".into(),
            0,
            PingMessage::type_id(),
        );
        (
            Self {
                peer,
                reader,
                codec: build_codec(),
            },
            formulator_address,
        )
    }

    fn send<T: WireMessage>(&self, msg: &T) {
        self.peer.send_packet(encode_packet(msg).unwrap()).unwrap();
    }

    async fn recv(&mut self) -> PofMessage {
        let (type_id, payload) = self.reader.next_frame().await.unwrap();
        self.codec.decode(type_id, &payload).unwrap()
    }

    /// Reads one frame, reporting whether the connection has failed.
    async fn reader_failed(&mut self) -> bool {
        self.reader.next_frame().await.is_err()
    }

    /// Reads frames until one matches `pick`, failing after `wait`.
    async fn recv_until<T>(
        &mut self,
        wait: Duration,
        mut pick: impl FnMut(PofMessage) -> Option<T>,
    ) -> T {
        timeout(wait, async {
            loop {
                let msg = self.recv().await;
                if let Some(found) = pick(msg) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for frame")
    }
}

struct Harness {
    node: Arc<FormulatorNode>,
    chain: Arc<MemChain>,
    signing_key: PrivateKey,
    formulator: Address,
    observer: FakeObserver,
    observer_key: PrivateKey,
}

async fn start_harness(max_blocks: u32) -> Harness {
    let chain_id = 1u8;
    let signing_key = PrivateKey::random();
    let node_key = PrivateKey::random();
    let observer_key = PrivateKey::random();
    let formulator = Address::new([0x42; 20]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let observer_addr = listener.local_addr().unwrap().to_string();

    let chain = Arc::new(MemChain::new(chain_id, now_nanos()));
    let mut config = FormulatorConfig::new(formulator);
    config.max_blocks_per_formulator = max_blocks;

    let mut observers = HashMap::new();
    observers.insert(observer_key.public_key().public_hash(), observer_addr);

    let node = Arc::new(FormulatorNode::new(
        config,
        signing_key.clone(),
        node_key,
        observers,
        HashMap::new(),
        chain.clone() as Arc<dyn Chain>,
        Arc::new(MemRank::single(formulator)),
        Arc::new(AcceptAllValidator),
        Arc::new(MemoryNodeStore::new()),
    ));
    node.init().unwrap();

    {
        let node = node.clone();
        tokio::spawn(async move {
            let _ = node.run("127.0.0.1:0").await;
        });
    }

    let (observer, dialed_as) = FakeObserver::accept(&listener, &observer_key, chain_id).await;
    assert_eq!(dialed_as, formulator);

    Harness {
        node,
        chain,
        signing_key,
        formulator,
        observer,
        observer_key,
    }
}

fn signed_transfer(sender: &PrivateKey, seq: u64) -> (Transaction, Vec<Signature>) {
    let tx = Transaction::transfer(
        sender.public_key().to_address(),
        Address::new([0xee; 20]),
        seq,
        100,
        now_nanos(),
    );
    let tx_hash = hash_transaction_by_type(1, 0, &tx);
    let sig = sender.sign(&tx_hash).unwrap();
    (tx, vec![sig])
}

async fn wait_for_height(chain: &MemChain, height: u32) {
    for _ in 0..200 {
        if chain.height() >= height {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("chain never reached height {height}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_generates_signs_and_commits() {
    let mut h = start_harness(2).await;

    // The formulator pushes its status as soon as the observer connects.
    let status = h
        .observer
        .recv_until(Duration::from_secs(3), |msg| match msg {
            PofMessage::Status(s) => Some(s),
            _ => None,
        })
        .await;
    assert_eq!(status.height, 0);
    assert_eq!(status.last_hash, h.chain.last_hash());

    // Three admissible transactions from distinct senders.
    let senders: Vec<PrivateKey> = (0..3).map(|_| PrivateKey::random()).collect();
    for sender in &senders {
        let (tx, sigs) = signed_transfer(sender, 1);
        h.node.add_tx(0, tx, sigs).unwrap();
    }
    assert_eq!(h.node.pool_size(), 3);

    // Observer requests the next block.
    let genesis_hash = h.chain.last_hash();
    h.observer.send(&BlockReqMessage {
        prev_hash: genesis_hash,
        target_height: 1,
        timeout_count: 0,
        formulator: h.formulator,
        formulator_public_hash: h.signing_key.public_key().public_hash(),
    });

    let gen = h
        .observer
        .recv_until(Duration::from_secs(5), |msg| match msg {
            PofMessage::BlockGen(gen) => Some(gen),
            _ => None,
        })
        .await;

    assert_eq!(gen.block.header.height, 1);
    assert_eq!(gen.block.header.prev_hash, genesis_hash);
    assert!(gen.block.header.timestamp > h.chain.last_timestamp());
    assert_eq!(gen.block.transactions.len(), 3);
    gen.block.validate_shape().unwrap();

    // The header signature recovers to the formulator's signing identity.
    let header_hash = gen.block.header.hash();
    let recovered = recover_public_hash(&header_hash, &gen.generator_signature).unwrap();
    assert_eq!(recovered, h.signing_key.public_key().public_hash());

    // Observers co-sign; the formulator assembles and commits.
    let second_observer = PrivateKey::random();
    let s1 = h.observer_key.sign(&header_hash).unwrap();
    let s2 = second_observer.sign(&header_hash).unwrap();
    h.observer.send(&BlockObSignMessage {
        target_height: 1,
        block_sign: BlockSign {
            header_hash,
            generator_signature: gen.generator_signature,
        },
        observer_signatures: vec![s1, s2],
    });

    wait_for_height(&h.chain, 1).await;
    let committed = h.chain.block(1).unwrap();
    assert_eq!(committed.header.hash(), header_hash);
    assert_eq!(
        committed.signatures,
        vec![gen.generator_signature, s1, s2]
    );
    // Included transactions left the pool.
    assert_eq!(h.node.pool_size(), 0);

    // The slot allows one more block; co-sign it too.
    let gen2 = h
        .observer
        .recv_until(Duration::from_secs(5), |msg| match msg {
            PofMessage::BlockGen(gen) => Some(gen),
            _ => None,
        })
        .await;
    assert_eq!(gen2.block.header.height, 2);
    assert_eq!(gen2.block.header.prev_hash, header_hash);
    assert!(gen2.block.header.timestamp > committed.header.timestamp);

    let header_hash2 = gen2.block.header.hash();
    let s1 = h.observer_key.sign(&header_hash2).unwrap();
    h.observer.send(&BlockObSignMessage {
        target_height: 2,
        block_sign: BlockSign {
            header_hash: header_hash2,
            generator_signature: gen2.generator_signature,
        },
        observer_signatures: vec![s1],
    });

    wait_for_height(&h.chain, 2).await;
    assert_eq!(h.chain.block(2).unwrap().header.hash(), header_hash2);

    h.node.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_and_stale_requests_are_suppressed() {
    let mut h = start_harness(1).await;

    h.observer.send(&BlockReqMessage {
        prev_hash: h.chain.last_hash(),
        target_height: 1,
        timeout_count: 0,
        formulator: h.formulator,
        formulator_public_hash: h.signing_key.public_key().public_hash(),
    });
    let gen = h
        .observer
        .recv_until(Duration::from_secs(5), |msg| match msg {
            PofMessage::BlockGen(gen) => Some(gen),
            _ => None,
        })
        .await;
    assert_eq!(gen.block.header.height, 1);

    // A repeated request for the just-generated height inside the 30 s
    // window must not produce another emission.
    h.observer.send(&BlockReqMessage {
        prev_hash: h.chain.last_hash(),
        target_height: 1,
        timeout_count: 0,
        formulator: h.formulator,
        formulator_public_hash: h.signing_key.public_key().public_hash(),
    });

    let extra = timeout(Duration::from_millis(500), async {
        loop {
            if let PofMessage::BlockGen(gen) = h.observer.recv().await {
                return gen;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "duplicate request must be suppressed");

    h.node.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn future_height_request_triggers_block_fetch() {
    let mut h = start_harness(1).await;

    // Chain is at 0; a request for height 3 is ahead of us, so the node
    // asks the observer for the missing run instead of generating.
    h.observer.send(&BlockReqMessage {
        prev_hash: Hash256::keccak256(b"unknown tip"),
        target_height: 3,
        timeout_count: 0,
        formulator: h.formulator,
        formulator_public_hash: h.signing_key.public_key().public_hash(),
    });

    let request = h
        .observer
        .recv_until(Duration::from_secs(3), |msg| match msg {
            PofMessage::Request(req) => Some(req),
            _ => None,
        })
        .await;
    assert_eq!(request.height, 1);
    assert_eq!(request.count, 2);

    h.node.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_block_at_known_height_drops_the_peer() {
    use bytes::Bytes;
    use pofcore_p2p::BlockMessage;
    use pofcore_types::{Block, Header};

    let mut h = start_harness(1).await;

    let make_block = |timestamp: u64| {
        Block::empty(Header {
            chain_id: 1,
            version: 1,
            height: 2, // ahead of the tip, so it stays queued
            prev_hash: Hash256::keccak256(b"parent"),
            context_hash: Hash256::NIL,
            timestamp,
            generator: h.formulator,
            consensus_data: Bytes::new(),
        })
    };

    let block_a = make_block(now_nanos());
    let block_b = make_block(now_nanos() + 1);
    assert_ne!(block_a.hash(), block_b.hash());

    h.observer.send(&BlockMessage {
        blocks: vec![block_a],
    });
    h.observer.send(&BlockMessage {
        blocks: vec![block_b],
    });

    // The fork is terminal for the delivering connection.
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            if h.observer.reader_failed().await {
                return;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "forked block must drop the delivering peer");

    h.node.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_enforces_the_sequence_window() {
    let h = start_harness(1).await;
    let sender = PrivateKey::random();

    // seq == current (0) is the past.
    let (tx, sigs) = signed_transfer(&sender, 0);
    let err = h.node.add_tx(0, tx, sigs).unwrap_err();
    assert!(err.to_string().contains("past seq"));

    // seq == current + 101 is too far ahead.
    let (tx, sigs) = signed_transfer(&sender, 101);
    let err = h.node.add_tx(0, tx, sigs).unwrap_err();
    assert!(err.to_string().contains("too far seq"));

    // seq == current + 1 is admissible exactly once.
    let (tx, sigs) = signed_transfer(&sender, 1);
    h.node.add_tx(0, tx.clone(), sigs.clone()).unwrap();
    let err = h.node.add_tx(0, tx, sigs).unwrap_err();
    assert!(err.to_string().contains("exist transaction"));
    assert_eq!(h.node.pool_size(), 1);

    h.node.close();
}
