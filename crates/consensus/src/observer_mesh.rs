//! The formulator's mesh of observer connections.
//!
//! The observer address map is fixed at construction. For every target an
//! outbound task dials with a 10 s timeout, runs the handshake (answer the
//! observer's challenge, then issue our own carrying the formulator
//! address), installs the peer keyed by the observer's public hash, and
//! serves the connection; on loss it retries after 1 s, forever.

use crate::messages::PofMessage;
use crate::{ConsensusError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pofcore_crypto::ecdsa::PrivateKey;
use pofcore_p2p::codec::encode_packet;
use pofcore_p2p::{handshake, MessageCodec, Peer, PeerReader, PingMessage, WireMessage};
use pofcore_types::{Address, PublicHash};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

/// Dial timeout for observer connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Back-off between reconnect attempts to an observer.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Connection events and messages from observer peers.
#[async_trait]
pub trait ObserverHandler: Send + Sync {
    /// An observer connection completed its handshake.
    async fn on_observer_connected(&self, peer: Arc<Peer>);

    /// An observer connection ended.
    async fn on_observer_disconnected(&self, peer: Arc<Peer>);

    /// A decoded message arrived from an observer.
    async fn on_observer_recv(&self, peer: Arc<Peer>, message: PofMessage) -> Result<()>;
}

/// Mesh over the fixed observer set.
pub struct ObserverMesh {
    chain_id: u8,
    key: PrivateKey,
    formulator: Address,
    net_addresses: HashMap<PublicHash, String>,
    peers: Mutex<HashMap<PublicHash, Arc<Peer>>>,
    handler: Weak<dyn ObserverHandler>,
    codec: Arc<MessageCodec<PofMessage>>,
    closed: AtomicBool,
}

impl ObserverMesh {
    /// Creates the mesh. `net_addresses` maps each observer's public hash to
    /// its network address and never changes afterwards.
    pub fn new(
        chain_id: u8,
        key: PrivateKey,
        formulator: Address,
        net_addresses: HashMap<PublicHash, String>,
        handler: Weak<dyn ObserverHandler>,
        codec: Arc<MessageCodec<PofMessage>>,
    ) -> Self {
        Self {
            chain_id,
            key,
            formulator,
            net_addresses,
            peers: Mutex::new(HashMap::new()),
            handler,
            codec,
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawns one reconnect task per observer target.
    pub fn run(self: &Arc<Self>) {
        for (target, addr) in self.net_addresses.clone() {
            let mesh = self.clone();
            tokio::spawn(async move {
                loop {
                    sleep(RECONNECT_BACKOFF).await;
                    if mesh.is_closed() {
                        return;
                    }
                    if mesh.peers.lock().contains_key(&target) {
                        continue;
                    }
                    if let Err(e) = mesh.connect(&addr, target).await {
                        debug!(observer = %target, %addr, error = %e, "observer dial failed");
                    }
                }
            });
        }
        info!(observers = self.net_addresses.len(), "observer mesh running");
    }

    /// Dials one observer and serves the connection until it ends.
    pub async fn connect(self: &Arc<Self>, addr: &str, target: PublicHash) -> Result<()> {
        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| pofcore_p2p::P2pError::ConnectTimeout)?
            .map_err(pofcore_p2p::P2pError::Io)?;

        // Answer the observer's challenge, then prove our own identity with
        // the formulator address bound into the record.
        handshake::answer_challenge(&mut stream, &self.key, self.chain_id, 0).await?;
        let pubhash =
            handshake::issue_challenge(&mut stream, self.chain_id, self.formulator.as_bytes())
                .await?;

        if pubhash != target {
            return Err(pofcore_p2p::P2pError::InvalidPublicHash.into());
        }
        if !self.net_addresses.contains_key(&pubhash) {
            return Err(pofcore_p2p::P2pError::InvalidPublicHash.into());
        }

        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos() as u64;
        let (peer, reader) = Peer::spawn(
            stream,
            pubhash,
            pubhash.to_string(),
            connected_at,
            PingMessage::type_id(),
        );

        if let Some(old) = self.peers.lock().insert(pubhash, peer.clone()) {
            old.close();
        }
        let result = self.handle_connection(peer.clone(), reader).await;
        self.drop_entry(&peer);
        result
    }

    async fn handle_connection(&self, peer: Arc<Peer>, mut reader: PeerReader) -> Result<()> {
        let Some(handler) = self.handler.upgrade() else {
            return Err(ConsensusError::Closed);
        };
        handler.on_observer_connected(peer.clone()).await;
        let result = loop {
            match reader.next_frame().await {
                Ok((type_id, payload)) => match self.codec.decode(type_id, &payload) {
                    Ok(message) => {
                        if let Err(e) = handler.on_observer_recv(peer.clone(), message).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e.into()),
                },
                Err(e) => break Err(e.into()),
            }
        };
        handler.on_observer_disconnected(peer.clone()).await;
        peer.close();
        result
    }

    fn drop_entry(&self, peer: &Arc<Peer>) {
        let mut peers = self.peers.lock();
        if let Some(current) = peers.get(&peer.id()) {
            if Arc::ptr_eq(current, peer) {
                peers.remove(&peer.id());
            }
        }
        peer.close();
    }

    /// The connected observer for `id`.
    pub fn get_peer(&self, id: &PublicHash) -> Option<Arc<Peer>> {
        self.peers.lock().get(id).cloned()
    }

    /// Every connected observer.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    /// Closes and drops the connection for `id`.
    pub fn remove_peer(&self, id: &PublicHash) {
        if let Some(peer) = self.peers.lock().remove(id) {
            peer.close();
        }
    }

    /// Sends a message to one observer; a failed send drops the peer.
    pub fn send_to<T: WireMessage>(&self, id: PublicHash, msg: &T) -> Result<()> {
        let peer = self
            .get_peer(&id)
            .ok_or(ConsensusError::NotExistObserverPeer)?;
        if peer.send_packet(encode_packet(msg)?).is_err() {
            self.remove_peer(&id);
        }
        Ok(())
    }

    /// Serializes once and fans out to every observer.
    pub fn broadcast<T: WireMessage>(&self, msg: &T) -> Result<()> {
        let packet = encode_packet(msg)?;
        for peer in self.peers() {
            let _ = peer.send_packet(packet.clone());
        }
        Ok(())
    }

    /// Shuts the mesh down and closes every connection.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let peers: Vec<Arc<Peer>> = self.peers.lock().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close();
        }
    }
}
