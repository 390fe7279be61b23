//! Message transport
//!
//! A small set of socket roles over TCP, each exchanging multipart messages
//! (see [`codec`]):
//!
//! ```text
//!   PubSocket ──fan-out──► SubSocket        (publishers, registry push stream)
//!   DealerSocket ◄──────► RouterSocket      (requesters, responders, registry RPC)
//! ```
//!
//! Every receiving socket reads from an inbound queue fed by a reader task.
//! The same queue accepts locally injected messages through a
//! [`ControlHandle`], which is how a blocked `recv` is woken from another
//! thread: the owner injects a fabricated cancel frame and the receive loop
//! recognizes it.

pub mod codec;
pub mod dealer;
pub mod pubsub;
pub mod router;

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use codec::Multipart;
pub use dealer::DealerSocket;
pub use pubsub::{PubSocket, SubSocket};
pub use router::{PeerTable, RouterSocket};

/// Identifier of a connection accepted or opened by a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Messages injected through a [`ControlHandle`]
    pub const LOCAL: PeerId = PeerId(0);

    /// Encode as a routing identity part
    pub fn to_part(self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    /// Decode a routing identity part
    pub fn from_part(part: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = part.try_into().ok()?;
        Some(PeerId(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == PeerId::LOCAL {
            f.write_str("local")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// A message together with the connection it arrived on
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Sending connection, [`PeerId::LOCAL`] for injected messages
    pub peer: PeerId,
    /// Message parts
    pub parts: Multipart,
}

impl Envelope {
    /// Check if the message was injected locally
    pub fn is_local(&self) -> bool {
        self.peer == PeerId::LOCAL
    }

    /// First part, if any
    pub fn first(&self) -> Option<&Bytes> {
        self.parts.first()
    }
}

/// Item of a socket's inbound queue
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Envelope),
    Closed(PeerId),
}

/// Handle injecting messages into a socket's inbound queue
///
/// Cloneable and usable from any thread; injected messages are delivered by
/// `recv` like remote ones but carry [`PeerId::LOCAL`].
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl ControlHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { tx }
    }

    /// Inject a message, returns false if the socket is gone
    pub fn send(&self, parts: Multipart) -> bool {
        self.tx
            .send(Inbound::Message(Envelope {
                peer: PeerId::LOCAL,
                parts,
            }))
            .is_ok()
    }
}

/// Spawn the task reading messages of one connection into an inbound queue
pub(crate) fn spawn_reader<R>(
    mut reader: R,
    peer: PeerId,
    tx: mpsc::UnboundedSender<Inbound>,
    max_part_size: usize,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match codec::read_multipart(&mut reader, max_part_size).await {
                Ok(Some(parts)) => {
                    if tx.send(Inbound::Message(Envelope { peer, parts })).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!(peer = %peer, "Connection closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "Connection read failed");
                    break;
                }
            }
        }

        let _ = tx.send(Inbound::Closed(peer));
    })
}

/// Spawn the task writing encoded frames to one connection
pub(crate) fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                tracing::debug!(error = %e, "Connection write failed");
                break;
            }
        }

        let _ = writer.shutdown().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_part() {
        let peer = PeerId(42);
        assert_eq!(PeerId::from_part(&peer.to_part()), Some(peer));
        assert_eq!(PeerId::from_part(b"short"), None);
        assert_eq!(PeerId::LOCAL.to_string(), "local");
        assert_eq!(peer.to_string(), "#42");
    }

    #[tokio::test]
    async fn test_control_handle_injects_local_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let control = ControlHandle::new(tx);

        assert!(control.send(vec![Bytes::from_static(b"CANCEL")]));

        match rx.recv().await {
            Some(Inbound::Message(envelope)) => {
                assert!(envelope.is_local());
                assert_eq!(envelope.first().unwrap().as_ref(), b"CANCEL");
            }
            other => panic!("unexpected inbound item: {:?}", other),
        }

        drop(rx);
        assert!(!control.send(vec![Bytes::new()]));
    }
}
