//! Per-peer chain position tracking.
//!
//! The board keeps one [`Status`] per connected node peer and one per
//! observer peer, under its own lock so status traffic never contends with
//! round handling. Selection helpers pick serving peers for block requests.

use parking_lot::Mutex;
use pofcore_p2p::{Status, StatusMessage};
use pofcore_types::PublicHash;
use std::collections::HashMap;

/// Status maps for both meshes.
#[derive(Default)]
pub struct StatusBoard {
    node: Mutex<HashMap<PublicHash, Status>>,
    observer: Mutex<HashMap<PublicHash, Status>>,
}

impl StatusBoard {
    /// Creates an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node peer with an empty status.
    pub fn node_connected(&self, id: PublicHash) {
        self.node.lock().insert(id, Status::default());
    }

    /// Drops a node peer's status.
    pub fn node_disconnected(&self, id: &PublicHash) {
        self.node.lock().remove(id);
    }

    /// Registers an observer peer with an empty status.
    pub fn observer_connected(&self, id: PublicHash) {
        self.observer.lock().insert(id, Status::default());
    }

    /// Drops an observer peer's status.
    pub fn observer_disconnected(&self, id: &PublicHash) {
        self.observer.lock().remove(id);
    }

    /// Applies a status message from a node peer.
    pub fn update_node(&self, id: &PublicHash, msg: &StatusMessage) {
        if let Some(status) = self.node.lock().get_mut(id) {
            status.update(msg);
        }
    }

    /// Applies a status message from an observer peer.
    pub fn update_observer(&self, id: &PublicHash, msg: &StatusMessage) {
        if let Some(status) = self.observer.lock().get_mut(id) {
            status.update(msg);
        }
    }

    /// Raises a node peer's height after it served blocks up to `height`.
    pub fn raise_node_height(&self, id: &PublicHash, height: u32) {
        if let Some(status) = self.node.lock().get_mut(id) {
            status.raise_height(height);
        }
    }

    /// Raises an observer peer's height.
    pub fn raise_observer_height(&self, id: &PublicHash, height: u32) {
        if let Some(status) = self.observer.lock().get_mut(id) {
            status.raise_height(height);
        }
    }

    /// A node peer's current status.
    pub fn node_status(&self, id: &PublicHash) -> Option<Status> {
        self.node.lock().get(id).cloned()
    }

    /// Picks a node peer able to serve the window starting above `base`.
    ///
    /// Peers covering the whole window (`base + 10`) are preferred; failing
    /// that, any peer at or above `base` serves a partial window. Returns
    /// the peer and its advertised height.
    pub fn select_node_peer(&self, base: u32) -> Option<(PublicHash, u32)> {
        let node = self.node.lock();
        for (id, status) in node.iter() {
            if base + 10 <= status.height {
                return Some((*id, status.height));
            }
        }
        for (id, status) in node.iter() {
            if base <= status.height {
                return Some((*id, status.height));
            }
        }
        None
    }

    /// Picks any observer peer whose advertised height covers `target`.
    pub fn select_observer_peer(&self, target: u32) -> Option<PublicHash> {
        let observer = self.observer.lock();
        observer
            .iter()
            .find(|(_, status)| target <= status.height)
            .map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pofcore_types::Hash256;

    fn id(n: u8) -> PublicHash {
        PublicHash::from(Hash256::keccak256(&[n]))
    }

    fn advertise(board: &StatusBoard, peer: PublicHash, height: u32) {
        board.update_node(
            &peer,
            &StatusMessage {
                version: 1,
                height,
                last_hash: Hash256::keccak256(&height.to_le_bytes()),
            },
        );
    }

    #[test]
    fn test_select_prefers_full_window_coverage() {
        let board = StatusBoard::new();
        board.node_connected(id(1));
        board.node_connected(id(2));
        advertise(&board, id(1), 12);
        advertise(&board, id(2), 25);

        // Window above 10: only peer 2 covers 20.
        let (picked, height) = board.select_node_peer(10).unwrap();
        assert_eq!(picked, id(2));
        assert_eq!(height, 25);
    }

    #[test]
    fn test_select_falls_back_to_partial_coverage() {
        let board = StatusBoard::new();
        board.node_connected(id(1));
        advertise(&board, id(1), 12);

        let (picked, height) = board.select_node_peer(10).unwrap();
        assert_eq!(picked, id(1));
        assert_eq!(height, 12);

        assert!(board.select_node_peer(13).is_none());
    }

    #[test]
    fn test_observer_selection_and_disconnect() {
        let board = StatusBoard::new();
        board.observer_connected(id(7));
        board.update_observer(
            &id(7),
            &StatusMessage {
                version: 1,
                height: 11,
                last_hash: Hash256::NIL,
            },
        );

        assert_eq!(board.select_observer_peer(11), Some(id(7)));
        assert_eq!(board.select_observer_peer(12), None);

        board.observer_disconnected(&id(7));
        assert_eq!(board.select_observer_peer(11), None);
    }
}
