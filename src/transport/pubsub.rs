//! Publish/subscribe sockets
//!
//! A [`PubSocket`] accepts any number of subscriber connections and fans
//! every message out to all of them. Messages are encoded once and shared
//! through a broadcast channel, each connection task writing the same buffer.
//!
//! A subscriber connection is only counted as joined once it has received
//! the welcome frame (a single empty part). Messages sent before that point
//! are not delivered to it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::Endpoint;

use super::codec::{self, Multipart};
use super::{spawn_reader, ControlHandle, Envelope, Inbound, PeerId};

/// Publishing side of a fan-out
pub struct PubSocket {
    tx: broadcast::Sender<Bytes>,
    local_addr: SocketAddr,
    max_part_size: usize,
    accept_task: JoinHandle<()>,
}

impl PubSocket {
    /// Bind and start accepting subscribers
    ///
    /// `capacity` bounds the number of messages a slow subscriber may lag
    /// behind before it starts losing the oldest ones. Subscribers are
    /// expected to read with the same `max_part_size`.
    pub async fn bind(addr: impl ToSocketAddrs, capacity: usize, max_part_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(capacity.max(1));
        let welcome = codec::encode(&[Bytes::new()], max_part_size)?;

        let accept_task = tokio::spawn(accept_loop(listener, tx.clone(), welcome));

        tracing::debug!(addr = %local_addr, "Publish socket bound");

        Ok(Self {
            tx,
            local_addr,
            max_part_size,
            accept_task,
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a message to every joined subscriber
    ///
    /// Returns the number of subscribers the message was queued for. A
    /// message subscribers would reject is not sent at all.
    pub fn send(&self, parts: &[Bytes]) -> Result<usize> {
        let frame = codec::encode(parts, self.max_part_size)?;
        Ok(self.tx.send(frame).unwrap_or(0))
    }

    /// Number of joined subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, tx: broadcast::Sender<Bytes>, welcome: Bytes) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let rx = tx.subscribe();
                tokio::spawn(serve_subscriber(socket, peer_addr, rx, welcome.clone()));
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept subscriber");
            }
        }
    }
}

async fn serve_subscriber(
    socket: TcpStream,
    peer_addr: SocketAddr,
    mut rx: broadcast::Receiver<Bytes>,
    welcome: Bytes,
) {
    let _ = socket.set_nodelay(true);
    let (mut read_half, mut write_half) = socket.into_split();

    if write_half.write_all(&welcome).await.is_err() {
        return;
    }

    tracing::debug!(peer = %peer_addr, "Subscriber joined");

    let mut scratch = [0u8; 64];
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(peer = %peer_addr, skipped = skipped, "Subscriber lagging, messages dropped");
                }
                Err(RecvError::Closed) => break,
            },
            // Subscribers never write, a read only completes on disconnect.
            read = read_half.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }

    let _ = write_half.shutdown().await;
    tracing::debug!(peer = %peer_addr, "Subscriber left");
}

/// Subscribing side of a fan-out
///
/// Keeps the messages whose first part equals one of the subscribed topics;
/// an empty topic matches everything. Messages injected through the
/// [`ControlHandle`] bypass the filter.
pub struct SubSocket {
    endpoint: Endpoint,
    topics: Mutex<Vec<Bytes>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    control: ControlHandle,
    reader: JoinHandle<()>,
    closed: AtomicBool,
    _writer: OwnedWriteHalf,
}

impl SubSocket {
    /// Connect and wait until the publisher has counted the connection
    pub async fn connect(endpoint: &Endpoint, max_part_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(endpoint.address()).await?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        if codec::read_multipart(&mut reader, max_part_size).await?.is_none() {
            return Err(Error::ConnectionClosed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = spawn_reader(reader, PeerId(1), tx.clone(), max_part_size);

        tracing::debug!(endpoint = %endpoint, "Subscribe socket connected");

        Ok(Self {
            endpoint: endpoint.clone(),
            topics: Mutex::new(Vec::new()),
            inbound: tokio::sync::Mutex::new(rx),
            control: ControlHandle::new(tx),
            reader: reader_task,
            closed: AtomicBool::new(false),
            _writer: write_half,
        })
    }

    /// Endpoint the socket is connected to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Add a topic filter
    pub fn subscribe(&self, topic: impl Into<Bytes>) {
        if let Ok(mut topics) = self.topics.lock() {
            topics.push(topic.into());
        }
    }

    /// Handle injecting local messages
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Receive the next matching message
    ///
    /// Returns `None` once the publisher connection is closed.
    pub async fn recv(&self) -> Option<Envelope> {
        let mut inbound = self.inbound.lock().await;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            match inbound.recv().await {
                Some(Inbound::Message(envelope)) => {
                    if envelope.is_local() || self.accepts(&envelope.parts) {
                        return Some(envelope);
                    }
                }
                Some(Inbound::Closed(_)) | None => {
                    self.closed.store(true, Ordering::Release);
                    return None;
                }
            }
        }
    }

    fn accepts(&self, parts: &Multipart) -> bool {
        let Some(first) = parts.first() else {
            return false;
        };

        match self.topics.lock() {
            Ok(topics) => topics.iter().any(|topic| topic.is_empty() || topic == first),
            Err(_) => false,
        }
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
