//! Integration tests: two node meshes over loopback TCP.

use async_trait::async_trait;
use pofcore_crypto::ecdsa::PrivateKey;
use pofcore_p2p::{
    MeshHandler, MemoryNodeStore, MessageCodec, NodeMesh, Peer, Result, Status, StatusMessage,
};
use pofcore_types::{Hash256, PublicHash};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

#[derive(Debug)]
enum TestMessage {
    Status(StatusMessage),
}

impl From<StatusMessage> for TestMessage {
    fn from(msg: StatusMessage) -> Self {
        TestMessage::Status(msg)
    }
}

struct CollectingHandler {
    recv_tx: mpsc::UnboundedSender<(PublicHash, TestMessage)>,
}

#[async_trait]
impl MeshHandler<TestMessage> for CollectingHandler {
    async fn on_connected(&self, _peer: Arc<Peer>) {}

    async fn on_disconnected(&self, _peer: Arc<Peer>) {}

    async fn on_recv(&self, peer: Arc<Peer>, message: TestMessage) -> Result<()> {
        let _ = self.recv_tx.send((peer.id(), message));
        Ok(())
    }
}

fn codec() -> Arc<MessageCodec<TestMessage>> {
    let mut codec = MessageCodec::new();
    codec.register::<StatusMessage>();
    Arc::new(codec)
}

struct TestNode {
    mesh: Arc<NodeMesh<TestMessage>>,
    id: PublicHash,
    recv_rx: mpsc::UnboundedReceiver<(PublicHash, TestMessage)>,
    _handler: Arc<CollectingHandler>,
}

fn make_node(key: PrivateKey) -> TestNode {
    let (recv_tx, recv_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(CollectingHandler { recv_tx });
    let weak = {
        let as_dyn: Arc<dyn MeshHandler<TestMessage>> = handler.clone();
        Arc::downgrade(&as_dyn)
    };
    let id = key.public_key().public_hash();
    let mesh = Arc::new(NodeMesh::new(
        1,
        key,
        HashMap::new(),
        weak,
        codec(),
        Arc::new(MemoryNodeStore::new()),
    ));
    TestNode {
        mesh,
        id,
        recv_rx,
        _handler: handler,
    }
}

async fn wait_for_peer(mesh: &Arc<NodeMesh<TestMessage>>, id: &PublicHash) {
    for _ in 0..100 {
        if mesh.get_peer(id).is_some() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("peer {id} never connected");
}

#[tokio::test]
async fn meshes_handshake_and_exchange_messages() {
    let server = make_node(PrivateKey::random());
    let mut client = make_node(PrivateKey::random());

    let addr = server.mesh.run("127.0.0.1:0".into()).await.unwrap();
    let _ = client.mesh.run("127.0.0.1:0".into()).await.unwrap();

    let client_mesh = client.mesh.clone();
    let server_id = server.id;
    tokio::spawn(async move {
        let _ = client_mesh
            .connect_client(&addr.to_string(), server_id)
            .await;
    });

    wait_for_peer(&client.mesh, &server.id).await;

    let status = StatusMessage {
        version: 1,
        height: 42,
        last_hash: Hash256::keccak256(b"tip"),
    };
    client.mesh.send_to(server.id, &status).unwrap();

    let mut server = server;
    let (from, received) = timeout(Duration::from_secs(3), server.recv_rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed");

    assert_eq!(from, client.id);
    let TestMessage::Status(received) = received;
    assert_eq!(received, status);

    // The acceptor can answer over the same connection.
    wait_for_peer(&server.mesh, &client.id).await;
    let reply = StatusMessage {
        version: 1,
        height: 43,
        last_hash: Hash256::keccak256(b"tip+1"),
    };
    server.mesh.send_to(client.id, &reply).unwrap();

    let (_, received) = timeout(Duration::from_secs(3), client.recv_rx.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("channel closed");
    let TestMessage::Status(received) = received;
    assert_eq!(received, reply);

    client.mesh.close();
    server.mesh.close();
}

#[tokio::test]
async fn status_tracking_is_monotonic() {
    let mut status = Status::default();
    status.update(&StatusMessage {
        version: 1,
        height: 8,
        last_hash: Hash256::keccak256(b"eight"),
    });
    status.update(&StatusMessage {
        version: 1,
        height: 3,
        last_hash: Hash256::keccak256(b"three"),
    });
    assert_eq!(status.height, 8);
}
