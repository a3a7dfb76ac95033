//! Dynamic node mesh.
//!
//! Maintains connections to a seed set plus gossip-discovered nodes. Peers we
//! dialed land in the client map, peers that dialed us in the server map;
//! lookups prefer the client side and a colliding older entry is closed.
//! A reconnect task per seed re-dials every 30 s while no connection exists,
//! and an accept loop serves inbound dials.

use crate::codec::{encode_packet, MessageCodec, WireMessage};
use crate::handshake;
use crate::messages::{PeerListMessage, PingMessage, RequestPeerListMessage};
use crate::nodestore::NodePoolStore;
use crate::peer::{Peer, PeerReader};
use crate::{P2pError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use pofcore_crypto::ecdsa::PrivateKey;
use pofcore_types::PublicHash;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Dial timeout for outbound connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Back-off between reconnect attempts to a node.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before the first dial after startup.
pub const INITIAL_DIAL_DELAY: Duration = Duration::from_secs(1);

/// Number of random targets for limited gossip casts.
pub const CAST_SAMPLE: usize = 3;

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}

/// Connection events and inbound messages delivered by a mesh.
///
/// An error from [`MeshHandler::on_recv`] is terminal for the delivering
/// peer: the mesh closes and removes it.
#[async_trait]
pub trait MeshHandler<M>: Send + Sync {
    /// A peer completed its handshake.
    async fn on_connected(&self, peer: Arc<Peer>);

    /// A peer was closed or dropped.
    async fn on_disconnected(&self, peer: Arc<Peer>);

    /// A decoded message arrived from a peer.
    async fn on_recv(&self, peer: Arc<Peer>, message: M) -> Result<()>;
}

/// Mesh over the dynamic node set.
pub struct NodeMesh<M> {
    chain_id: u8,
    key: PrivateKey,
    my_public_hash: PublicHash,
    bind_address: RwLock<String>,
    node_set: Mutex<HashMap<PublicHash, String>>,
    client_peers: Mutex<HashMap<PublicHash, Arc<Peer>>>,
    server_peers: Mutex<HashMap<PublicHash, Arc<Peer>>>,
    handler: Weak<dyn MeshHandler<M>>,
    codec: Arc<MessageCodec<M>>,
    store: Arc<dyn NodePoolStore>,
    closed: AtomicBool,
}

impl<M: Send + 'static> NodeMesh<M> {
    /// Creates a mesh over `seeds`. The handler is held weakly; the embedder
    /// keeps the owning reference.
    pub fn new(
        chain_id: u8,
        key: PrivateKey,
        seeds: HashMap<PublicHash, String>,
        handler: Weak<dyn MeshHandler<M>>,
        codec: Arc<MessageCodec<M>>,
        store: Arc<dyn NodePoolStore>,
    ) -> Self {
        let my_public_hash = key.public_key().public_hash();
        Self {
            chain_id,
            key,
            my_public_hash,
            bind_address: RwLock::new(String::new()),
            node_set: Mutex::new(seeds),
            client_peers: Mutex::new(HashMap::new()),
            server_peers: Mutex::new(HashMap::new()),
            handler,
            codec,
            store,
            closed: AtomicBool::new(false),
        }
    }

    /// Our own peer identity.
    pub fn public_hash(&self) -> PublicHash {
        self.my_public_hash
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Binds the listener, spawns the per-seed reconnect tasks and the
    /// accept loop, and returns the bound address.
    pub async fn run(self: &Arc<Self>, bind_address: String) -> Result<SocketAddr> {
        *self.bind_address.write() = bind_address.clone();

        let seeds: Vec<(PublicHash, String)> = self
            .node_set
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (target, addr) in seeds {
            if target == self.my_public_hash {
                continue;
            }
            let mesh = self.clone();
            tokio::spawn(async move { mesh.reconnect_loop(target, addr).await });
        }

        let listener = TcpListener::bind(&bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "node mesh listening");

        let mesh = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let mesh = mesh.clone();
                        tokio::spawn(async move {
                            if let Err(e) = mesh.handle_inbound(stream).await {
                                debug!(%remote, error = %e, "inbound connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        if mesh.is_closed() {
                            return;
                        }
                        warn!(error = %e, "accept failed");
                    }
                }
                if mesh.is_closed() {
                    return;
                }
            }
        });

        Ok(local_addr)
    }

    async fn reconnect_loop(self: Arc<Self>, target: PublicHash, addr: String) {
        sleep(INITIAL_DIAL_DELAY).await;
        loop {
            if self.is_closed() {
                return;
            }
            if !self.node_set.lock().contains_key(&target) {
                return;
            }
            let connected = self.client_peers.lock().contains_key(&target)
                || self.server_peers.lock().contains_key(&target);
            if !connected {
                if let Err(e) = self.connect_client(&addr, target).await {
                    debug!(%target, %addr, error = %e, "dial failed");
                }
            }
            sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// Dials a node, runs the handshake and serves the connection until it
    /// ends. The call returns when the connection is gone.
    pub async fn connect_client(self: &Arc<Self>, addr: &str, target: PublicHash) -> Result<()> {
        let start = Instant::now();
        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| P2pError::ConnectTimeout)??;

        // Client role: answer the acceptor's challenge, then issue ours.
        handshake::answer_challenge(&mut stream, &self.key, self.chain_id, 0).await?;
        let bind = self.bind_address.read().clone();
        handshake::write_bind_addr(&mut stream, &bind).await?;
        let pubhash = handshake::issue_challenge(&mut stream, self.chain_id, &[]).await?;
        let peer_bind = handshake::read_bind_addr(&mut stream).await?;

        if pubhash != target || pubhash == self.my_public_hash {
            return Err(P2pError::InvalidPublicHash);
        }

        let ip = stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        self.store
            .new_node(format!("{ip}{peer_bind}"), pubhash, start.elapsed());

        let (peer, reader) = Peer::spawn(
            stream,
            pubhash,
            pubhash.to_string(),
            now_nanos(),
            PingMessage::type_id(),
        );
        if let Some(old) = self.client_peers.lock().insert(pubhash, peer.clone()) {
            old.close();
        }
        let result = self.handle_connection(peer.clone(), reader).await;
        Self::drop_entry(&self.client_peers, &peer);
        result
    }

    async fn handle_inbound(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let start = Instant::now();

        // Server role: issue our challenge first, then answer theirs.
        let pubhash = handshake::issue_challenge(&mut stream, self.chain_id, &[]).await?;
        let peer_bind = handshake::read_bind_addr(&mut stream).await?;
        handshake::answer_challenge(&mut stream, &self.key, self.chain_id, 0).await?;
        let bind = self.bind_address.read().clone();
        handshake::write_bind_addr(&mut stream, &bind).await?;

        if pubhash == self.my_public_hash {
            return Err(P2pError::InvalidPublicHash);
        }

        let ip = stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        self.store
            .new_node(format!("{ip}{peer_bind}"), pubhash, start.elapsed());

        let (peer, reader) = Peer::spawn(
            stream,
            pubhash,
            pubhash.to_string(),
            now_nanos(),
            PingMessage::type_id(),
        );
        if let Some(old) = self.server_peers.lock().insert(pubhash, peer.clone()) {
            old.close();
        }
        let result = self.handle_connection(peer.clone(), reader).await;
        Self::drop_entry(&self.server_peers, &peer);
        result
    }

    async fn handle_connection(&self, peer: Arc<Peer>, mut reader: PeerReader) -> Result<()> {
        let Some(handler) = self.handler.upgrade() else {
            return Err(P2pError::PeerClosed);
        };
        handler.on_connected(peer.clone()).await;
        let result = loop {
            match reader.next_frame().await {
                Ok((type_id, payload)) => match self.codec.decode(type_id, &payload) {
                    Ok(message) => {
                        if let Err(e) = handler.on_recv(peer.clone(), message).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                },
                Err(e) => break Err(e),
            }
        };
        handler.on_disconnected(peer.clone()).await;
        peer.close();
        result
    }

    fn drop_entry(map: &Mutex<HashMap<PublicHash, Arc<Peer>>>, peer: &Arc<Peer>) {
        let mut map = map.lock();
        if let Some(current) = map.get(&peer.id()) {
            if Arc::ptr_eq(current, peer) {
                map.remove(&peer.id());
            }
        }
        peer.close();
    }

    /// Returns the connection for `id`, preferring the client side.
    pub fn get_peer(&self, id: &PublicHash) -> Option<Arc<Peer>> {
        if let Some(peer) = self.client_peers.lock().get(id) {
            return Some(peer.clone());
        }
        self.server_peers.lock().get(id).cloned()
    }

    /// Every connected peer, deduplicated with client preference.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut map: HashMap<PublicHash, Arc<Peer>> = HashMap::new();
        for (id, peer) in self.server_peers.lock().iter() {
            map.insert(*id, peer.clone());
        }
        for (id, peer) in self.client_peers.lock().iter() {
            map.insert(*id, peer.clone());
        }
        map.into_values().collect()
    }

    /// Closes and drops both map entries for `id`.
    pub fn remove_peer(&self, id: &PublicHash) {
        let client = self.client_peers.lock().remove(id);
        let server = self.server_peers.lock().remove(id);
        if let Some(peer) = client {
            peer.close();
        }
        if let Some(peer) = server {
            peer.close();
        }
    }

    /// Sends a pre-encoded frame to one peer; a failed send drops the peer.
    pub fn send_packet_to(&self, id: PublicHash, packet: Vec<u8>) -> Result<()> {
        let peer = self.get_peer(&id).ok_or(P2pError::NotExistPeer)?;
        if peer.send_packet(packet).is_err() {
            self.remove_peer(&id);
        }
        Ok(())
    }

    /// Serializes and sends a message to one peer.
    pub fn send_to<T: WireMessage>(&self, id: PublicHash, msg: &T) -> Result<()> {
        self.send_packet_to(id, encode_packet(msg)?)
    }

    /// Fans a pre-encoded frame out to every peer.
    pub fn broadcast_packet(&self, packet: Vec<u8>) {
        for peer in self.peers() {
            let _ = peer.send_packet(packet.clone());
        }
    }

    /// Serializes once and fans out to every peer.
    pub fn broadcast<T: WireMessage>(&self, msg: &T) -> Result<()> {
        self.broadcast_packet(encode_packet(msg)?);
        Ok(())
    }

    /// Sends a frame to up to 3 random peers, excluding `except`.
    ///
    /// Peer ids are sorted before sampling so the draw is over a stable
    /// order. `limit` values above the sample size are not honored further.
    pub fn except_cast_limit(&self, except: Option<PublicHash>, packet: Vec<u8>, _limit: u8) {
        let mut ids: Vec<PublicHash> = self
            .peers()
            .iter()
            .map(|p| p.id())
            .filter(|id| Some(*id) != except)
            .collect();
        ids.sort();
        if ids.is_empty() {
            return;
        }

        let mut rng = rand::thread_rng();
        let mut targets = HashSet::new();
        for _ in 0..CAST_SAMPLE {
            targets.insert(ids[rng.gen_range(0..ids.len())]);
        }
        for id in targets {
            if let Some(peer) = self.get_peer(&id) {
                let _ = peer.send_packet(packet.clone());
            }
        }
    }

    /// Merges gossiped peer addresses into the node store.
    pub fn add_peer_list(&self, ips: Vec<String>, hashes: Vec<String>) {
        self.store.add_peer_list(ips, hashes);
    }

    /// Answers a peer-list request from `id`.
    pub fn send_peer_list(&self, id: PublicHash) -> Result<()> {
        let (ips, hashes) = self.store.get_peer_list();
        self.send_to(id, &PeerListMessage { ips, hashes })
    }

    /// Asks `id` for its peer list.
    pub fn request_peer_list(&self, id: PublicHash) -> Result<()> {
        self.send_to(id, &RequestPeerListMessage)
    }

    /// Shuts the mesh down and closes every peer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for peer in self.peers() {
            peer.close();
        }
        self.client_peers.lock().clear();
        self.server_peers.lock().clear();
    }
}
