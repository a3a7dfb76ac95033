//! One framed peer connection.
//!
//! A [`Peer`] owns the write side of a connection: packets are queued onto a
//! channel drained by a writer task that also emits keepalive pings. The
//! paired [`PeerReader`] is driven by the owning mesh's connection task and
//! yields decompressed `(type_id, payload)` frames.
//!
//! Liveness policy: a ping is written every 10 s under a 5 s write deadline
//! and bumps a miss counter; any inbound frame resets it. More than 3
//! unanswered pings, a missed write deadline, or 40 s of read silence closes
//! the peer. There is no partial-frame recovery; any framing or I/O error is
//! terminal for the connection.

use crate::codec::{decompress, ping_packet};
use crate::{P2pError, Result};
use pofcore_types::PublicHash;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, trace};

/// Deadline for any single socket write.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Keepalive ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Unanswered pings tolerated before the connection is closed.
pub const PING_MISS_LIMIT: u64 = 3;

/// Reads idle longer than this close the connection. Covers the full ping
/// miss budget plus one interval of slack.
pub const READ_IDLE_LIMIT: Duration = Duration::from_secs(40);

/// Frames larger than this are rejected outright.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

struct Shared {
    closed: AtomicBool,
    close_notify: Notify,
    ping_misses: AtomicU64,
}

/// The write side and metadata of one connection.
pub struct Peer {
    id: PublicHash,
    name: String,
    connected_at: u64,
    guess_height: AtomicU32,
    packet_tx: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl Peer {
    /// Splits a connected stream into a peer handle and its reader, spawning
    /// the writer/keepalive task.
    pub fn spawn(
        stream: TcpStream,
        id: PublicHash,
        name: String,
        connected_at: u64,
        ping_type: u16,
    ) -> (Arc<Peer>, PeerReader) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            ping_misses: AtomicU64::new(0),
        });

        tokio::spawn(write_loop(
            write_half,
            packet_rx,
            shared.clone(),
            ping_type,
        ));

        let peer = Arc::new(Peer {
            id,
            name,
            connected_at,
            guess_height: AtomicU32::new(0),
            packet_tx,
            shared: shared.clone(),
        });
        let reader = PeerReader {
            read: read_half,
            shared,
            ping_type,
        };
        (peer, reader)
    }

    /// The peer's identity (its public hash).
    pub fn id(&self) -> PublicHash {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unix nanoseconds when the connection completed its handshake.
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Last height we believe this peer has, updated from served blocks.
    pub fn guess_height(&self) -> u32 {
        self.guess_height.load(Ordering::Relaxed)
    }

    /// Updates the guessed height.
    pub fn update_guess_height(&self, height: u32) {
        self.guess_height.store(height, Ordering::Relaxed);
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Queues a pre-encoded frame for sending.
    pub fn send_packet(&self, packet: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(P2pError::PeerClosed);
        }
        self.packet_tx
            .send(packet)
            .map_err(|_| P2pError::PeerClosed)
    }

    /// Closes the connection; both the writer task and the reader observe it.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.close_notify.notify_waiters();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_with_deadline(write: &mut OwnedWriteHalf, packet: &[u8]) -> Result<()> {
    match timeout(WRITE_DEADLINE, write.write_all(packet)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(P2pError::WriteTimeout),
    }
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    mut packet_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
    ping_type: u16,
) {
    let mut ticker = interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Consume the immediate first tick so the first ping lands one interval in.
    ticker.tick().await;

    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            maybe = packet_rx.recv() => {
                match maybe {
                    Some(packet) => {
                        if let Err(e) = write_with_deadline(&mut write, &packet).await {
                            debug!(error = %e, "peer write failed");
                            break;
                        }
                        trace!(bytes = packet.len(), "frame written");
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = write_with_deadline(&mut write, &ping_packet(ping_type)).await {
                    debug!(error = %e, "keepalive write failed");
                    break;
                }
                let misses = shared.ping_misses.fetch_add(1, Ordering::Relaxed) + 1;
                if misses > PING_MISS_LIMIT {
                    debug!(misses, "keepalive miss limit exceeded");
                    break;
                }
            }
            _ = shared.close_notify.notified() => break,
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    shared.close_notify.notify_waiters();
    let _ = write.shutdown().await;
}

/// The read side of one connection.
pub struct PeerReader {
    read: OwnedReadHalf,
    shared: Arc<Shared>,
    ping_type: u16,
}

impl PeerReader {
    /// Reads the next non-ping frame, returning its type id and decompressed
    /// payload. Any error is terminal for the connection.
    pub async fn next_frame(&mut self) -> Result<(u16, Vec<u8>)> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(P2pError::PeerClosed);
        }
        let shared = self.shared.clone();
        tokio::select! {
            _ = shared.close_notify.notified() => Err(P2pError::PeerClosed),
            result = timeout(READ_IDLE_LIMIT, Self::read_frame(&mut self.read, &self.shared, self.ping_type)) => {
                match result {
                    Ok(frame) => frame,
                    Err(_) => Err(P2pError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read idle limit exceeded",
                    ))),
                }
            }
        }
    }

    async fn read_frame(
        read: &mut OwnedReadHalf,
        shared: &Shared,
        ping_type: u16,
    ) -> Result<(u16, Vec<u8>)> {
        loop {
            let mut type_buf = [0u8; 2];
            read.read_exact(&mut type_buf).await?;
            // Any inbound traffic proves the peer alive.
            shared.ping_misses.store(0, Ordering::Relaxed);

            let type_id = u16::from_le_bytes(type_buf);
            if type_id == ping_type {
                continue;
            }

            let mut len_buf = [0u8; 4];
            read.read_exact(&mut len_buf).await?;
            let len = u32::from_le_bytes(len_buf);
            if len == 0 {
                return Err(P2pError::UnknownMessage(type_id));
            }
            if len > MAX_FRAME_SIZE {
                return Err(P2pError::InvalidLength);
            }

            let mut flag = [0u8; 1];
            read.read_exact(&mut flag).await?;
            let mut body = vec![0u8; len as usize];
            read.read_exact(&mut body).await?;

            return Ok((type_id, decompress(flag[0], body)?));
        }
    }
}
