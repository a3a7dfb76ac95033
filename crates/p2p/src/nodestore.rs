//! Node pool store seam.
//!
//! The mesh reports discovered nodes and consumes peer lists through this
//! trait; persistence (if any) belongs to the embedder. The bundled
//! [`MemoryNodeStore`] keeps everything in memory.

use parking_lot::Mutex;
use pofcore_types::PublicHash;
use std::collections::HashMap;
use std::time::Duration;

/// Store of known node addresses, fed by handshakes and peer-list gossip.
pub trait NodePoolStore: Send + Sync {
    /// Records a node observed via a completed handshake.
    fn new_node(&self, addr: String, id: PublicHash, rtt: Duration);

    /// Merges a gossiped peer list (`hashes` parallel to `ips`, hex ids).
    fn add_peer_list(&self, ips: Vec<String>, hashes: Vec<String>);

    /// Returns the known peer list as `(ips, hex hashes)`.
    fn get_peer_list(&self) -> (Vec<String>, Vec<String>);
}

#[derive(Debug, Clone)]
struct NodeRecord {
    addr: String,
    rtt: Option<Duration>,
}

/// In-memory node pool store.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<HashMap<PublicHash, NodeRecord>>,
}

impl MemoryNodeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}

impl NodePoolStore for MemoryNodeStore {
    fn new_node(&self, addr: String, id: PublicHash, rtt: Duration) {
        self.nodes.lock().insert(
            id,
            NodeRecord {
                addr,
                rtt: Some(rtt),
            },
        );
    }

    fn add_peer_list(&self, ips: Vec<String>, hashes: Vec<String>) {
        let mut nodes = self.nodes.lock();
        for (ip, hash) in ips.into_iter().zip(hashes) {
            let Ok(id) = hash.parse::<PublicHash>() else {
                continue;
            };
            nodes
                .entry(id)
                .or_insert(NodeRecord { addr: ip, rtt: None });
        }
    }

    fn get_peer_list(&self) -> (Vec<String>, Vec<String>) {
        let nodes = self.nodes.lock();
        let mut ips = Vec::with_capacity(nodes.len());
        let mut hashes = Vec::with_capacity(nodes.len());
        for (id, record) in nodes.iter() {
            ips.push(record.addr.clone());
            hashes.push(id.to_hex());
        }
        (ips, hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pofcore_types::Hash256;

    #[test]
    fn test_new_node_and_peer_list_roundtrip() {
        let store = MemoryNodeStore::new();
        let id = PublicHash::from(Hash256::keccak256(b"n1"));
        store.new_node("10.0.0.1:38755".into(), id, Duration::from_millis(12));

        let (ips, hashes) = store.get_peer_list();
        assert_eq!(ips, vec!["10.0.0.1:38755".to_string()]);
        assert_eq!(hashes, vec![id.to_hex()]);

        // Gossip about the same node does not clobber the handshake record.
        store.add_peer_list(vec!["10.9.9.9:1".into()], hashes.clone());
        let (ips, _) = store.get_peer_list();
        assert_eq!(ips, vec!["10.0.0.1:38755".to_string()]);
    }

    #[test]
    fn test_add_peer_list_skips_bad_hashes() {
        let store = MemoryNodeStore::new();
        store.add_peer_list(
            vec!["10.0.0.2:1".into(), "10.0.0.3:1".into()],
            vec!["not-hex".into(), PublicHash::ZERO.to_hex()],
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rtt_is_recorded() {
        let store = MemoryNodeStore::new();
        let id = PublicHash::from(Hash256::keccak256(b"n2"));
        store.new_node("10.0.0.4:1".into(), id, Duration::from_millis(5));
        let nodes = store.nodes.lock();
        assert_eq!(nodes.get(&id).unwrap().rtt, Some(Duration::from_millis(5)));
    }
}
