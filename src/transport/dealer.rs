//! Dealer socket
//!
//! Client side of request/reply: one connection, messages sent and received
//! in order, no envelope handling.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::Endpoint;

use super::codec;
use super::{spawn_reader, ControlHandle, Envelope, Inbound, PeerId};

/// Connected request/reply client socket
pub struct DealerSocket {
    endpoint: Endpoint,
    writer: Mutex<OwnedWriteHalf>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    control: ControlHandle,
    reader: JoinHandle<()>,
    closed: AtomicBool,
    max_part_size: usize,
}

impl DealerSocket {
    /// Connect to a router socket
    pub async fn connect(endpoint: &Endpoint, max_part_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(endpoint.address()).await?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = spawn_reader(BufReader::new(read_half), PeerId(1), tx.clone(), max_part_size);

        tracing::trace!(endpoint = %endpoint, "Dealer socket connected");

        Ok(Self {
            endpoint: endpoint.clone(),
            writer: Mutex::new(write_half),
            inbound: Mutex::new(rx),
            control: ControlHandle::new(tx),
            reader,
            closed: AtomicBool::new(false),
            max_part_size,
        })
    }

    /// Endpoint the socket is connected to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Check if the connection was seen closed by `recv`
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Handle injecting local messages
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Send one message
    ///
    /// Fails with [`Error::MessageTooLarge`] before writing anything if the
    /// router would reject the message.
    pub async fn send(&self, parts: &[Bytes]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        codec::write_multipart(&mut *writer, parts, self.max_part_size).await
    }

    /// Receive the next message (or local injection)
    ///
    /// Returns `None` once the connection is closed.
    pub async fn recv(&self) -> Option<Envelope> {
        let mut inbound = self.inbound.lock().await;

        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        match inbound.recv().await {
            Some(Inbound::Message(envelope)) => Some(envelope),
            Some(Inbound::Closed(_)) | None => {
                self.closed.store(true, Ordering::Release);
                None
            }
        }
    }
}

impl Drop for DealerSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RouterSocket;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = DealerSocket::connect(&Endpoint::new("127.0.0.1", port), 1024).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_recv_ends_when_router_dropped() {
        let router = RouterSocket::bind("127.0.0.1:0", 1024).await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", router.local_addr().port());
        let dealer = DealerSocket::connect(&endpoint, 1024).await.unwrap();

        dealer.send(&[Bytes::from_static(b"hello")]).await.unwrap();
        let envelope = timeout(Duration::from_secs(2), router.recv()).await.unwrap().unwrap();
        assert_eq!(envelope.parts, vec![Bytes::from_static(b"hello")]);

        drop(router);

        let result = timeout(Duration::from_secs(2), dealer.recv()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_oversized_send_keeps_connection() {
        let router = RouterSocket::bind("127.0.0.1:0", 1024).await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", router.local_addr().port());
        let dealer = DealerSocket::connect(&endpoint, 1024).await.unwrap();

        let result = dealer.send(&[Bytes::from(vec![0u8; 4096])]).await;
        assert!(matches!(result, Err(Error::MessageTooLarge(_))));

        dealer.send(&[Bytes::from_static(b"after")]).await.unwrap();
        let envelope = timeout(Duration::from_secs(2), router.recv()).await.unwrap().unwrap();
        assert_eq!(envelope.parts, vec![Bytes::from_static(b"after")]);
    }
}
