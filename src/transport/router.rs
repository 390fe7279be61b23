//! Router socket
//!
//! Accepts connections and tags every received message with the
//! [`PeerId`] of its connection, so that replies can be routed back with
//! [`RouterSocket::send_to`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::BufReader;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::Result;

use super::codec;
use super::{spawn_reader, spawn_writer, ControlHandle, Envelope, Inbound, PeerId};

/// Outgoing queues of the connected peers
///
/// Cloneable, so that tasks other than the receiving one can route replies.
#[derive(Debug, Clone)]
pub struct PeerTable {
    inner: Arc<Mutex<HashMap<PeerId, Peer>>>,
    max_part_size: usize,
}

#[derive(Debug)]
struct Peer {
    tx: mpsc::UnboundedSender<Bytes>,
    reader: AbortHandle,
}

impl PeerTable {
    fn new(max_part_size: usize) -> Self {
        Self {
            inner: Arc::default(),
            max_part_size,
        }
    }

    /// Send a message to one peer
    ///
    /// Returns false if the peer is unknown or disconnected; the message is
    /// then dropped. Fails without sending if the peer would reject it.
    pub fn send(&self, peer: PeerId, parts: &[Bytes]) -> Result<bool> {
        let frame = codec::encode(parts, self.max_part_size)?;

        let tx = match self.inner.lock() {
            Ok(peers) => peers.get(&peer).map(|entry| entry.tx.clone()),
            Err(_) => None,
        };

        match tx {
            Some(tx) => Ok(tx.send(frame).is_ok()),
            None => {
                tracing::debug!(peer = %peer, "Dropping message for unknown peer");
                Ok(false)
            }
        }
    }

    /// Number of connected peers
    pub fn len(&self) -> usize {
        self.inner.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    /// Check if no peer is connected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, peer: PeerId, tx: mpsc::UnboundedSender<Bytes>, reader: AbortHandle) {
        if let Ok(mut peers) = self.inner.lock() {
            peers.insert(peer, Peer { tx, reader });
        }
    }

    fn remove(&self, peer: PeerId) {
        if let Ok(mut peers) = self.inner.lock() {
            peers.remove(&peer);
        }
    }

    /// Disconnect every peer
    fn clear(&self) {
        if let Ok(mut peers) = self.inner.lock() {
            for (_, entry) in peers.drain() {
                entry.reader.abort();
            }
        }
    }
}

/// Server side of request/reply
pub struct RouterSocket {
    local_addr: SocketAddr,
    peers: PeerTable,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    control: ControlHandle,
    accept_task: JoinHandle<()>,
}

impl RouterSocket {
    /// Bind and start accepting connections
    pub async fn bind(addr: impl ToSocketAddrs, max_part_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let peers = PeerTable::new(max_part_size);
        let (tx, rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(accept_loop(listener, peers.clone(), tx.clone(), max_part_size));

        tracing::debug!(addr = %local_addr, "Router socket bound");

        Ok(Self {
            local_addr,
            peers,
            inbound: tokio::sync::Mutex::new(rx),
            control: ControlHandle::new(tx),
            accept_task,
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle injecting local messages
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Routing table of the connected peers
    pub fn peers(&self) -> PeerTable {
        self.peers.clone()
    }

    /// Receive the next message from any peer (or a local injection)
    pub async fn recv(&self) -> Option<Envelope> {
        let mut inbound = self.inbound.lock().await;

        loop {
            match inbound.recv().await {
                Some(Inbound::Message(envelope)) => return Some(envelope),
                Some(Inbound::Closed(peer)) => {
                    tracing::trace!(peer = %peer, "Peer disconnected");
                }
                None => return None,
            }
        }
    }

    /// Send a message to one peer, see [`PeerTable::send`]
    pub fn send_to(&self, peer: PeerId, parts: &[Bytes]) -> Result<bool> {
        self.peers.send(peer, parts)
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.peers.clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: PeerTable,
    tx: mpsc::UnboundedSender<Inbound>,
    max_part_size: usize,
) {
    let mut next_peer = 1u64;

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let _ = socket.set_nodelay(true);
        let peer = PeerId(next_peer);
        next_peer += 1;

        let (read_half, write_half) = socket.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let writer = spawn_writer(write_half, out_rx);
        let reader = spawn_reader(BufReader::new(read_half), peer, tx.clone(), max_part_size);
        peers.insert(peer, out_tx, reader.abort_handle());

        tracing::debug!(peer = %peer, addr = %peer_addr, "Connection accepted");

        let peers = peers.clone();
        tokio::spawn(async move {
            let _ = reader.await;
            peers.remove(peer);
            writer.abort();
        });
    }
}
