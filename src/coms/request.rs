//! Requests received by responders

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::ComsMessage;
use crate::transport::{codec, Multipart, PeerId, PeerTable, RouterSocket};

/// Application that sent a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequesterIdentity {
    pub application_name: String,
    pub application_id: i32,
    /// Registry endpoint of the requester application
    pub server_endpoint: String,
    pub server_proxy_port: u16,
}

impl fmt::Display for RequesterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}@{}",
            self.application_name, self.application_id, self.server_endpoint
        )
    }
}

/// Decoded data-plane message received by a responder
#[derive(Debug)]
pub(crate) enum Incoming {
    Sync { header: Bytes },
    Cancel { header: Bytes },
    Request {
        header: Bytes,
        requester: RequesterIdentity,
        first: Bytes,
        second: Option<Bytes>,
    },
    Other(ComsMessage),
}

/// Decode `[identity, control, payload, payload?]`
pub(crate) fn decode_incoming(parts: &[Bytes]) -> Result<Incoming> {
    let (header, control) = match parts {
        [header, control, ..] => (header.clone(), ComsMessage::from_part(control)?),
        _ => return Err(Error::decode("data-plane message without control part")),
    };

    let incoming = match control {
        ComsMessage::Sync => Incoming::Sync { header },
        ComsMessage::Cancel => Incoming::Cancel { header },
        ComsMessage::Request {
            application_name,
            application_id,
            server_endpoint,
            server_proxy_port,
        } => {
            let first = parts
                .get(2)
                .cloned()
                .ok_or_else(|| Error::decode("request without payload"))?;
            Incoming::Request {
                header,
                requester: RequesterIdentity {
                    application_name,
                    application_id,
                    server_endpoint,
                    server_proxy_port,
                },
                first,
                second: parts.get(3).cloned(),
            }
        }
        other => Incoming::Other(other),
    };

    Ok(incoming)
}

/// Acknowledgement frame for sync and cancel messages
pub(crate) fn ack(header: Bytes) -> Multipart {
    vec![header, ComsMessage::Ack.to_part()]
}

/// Acknowledge a sync or cancel message on `socket`
pub(crate) fn send_ack(socket: &RouterSocket, peer: PeerId, header: Bytes) {
    if let Err(e) = socket.send_to(peer, &ack(header)) {
        tracing::warn!(peer = %peer, error = %e, "Failed to acknowledge");
    }
}

/// Path a reply takes back to the requester
pub(crate) enum ReplyRoute {
    /// Straight back on the connection the request arrived on
    Direct {
        peers: PeerTable,
        peer: PeerId,
        header: Bytes,
    },
    /// Through the router owning the requester connection
    Routed {
        back: mpsc::UnboundedSender<(PeerId, Multipart)>,
        proxy: PeerId,
        header: Bytes,
        max_part_size: usize,
    },
}

impl ReplyRoute {
    fn send(&self, body: Vec<Bytes>) -> Result<bool> {
        match self {
            ReplyRoute::Direct { peers, peer, header } => {
                let mut parts = Vec::with_capacity(body.len() + 1);
                parts.push(header.clone());
                parts.extend(body);
                peers.send(*peer, &parts)
            }
            ReplyRoute::Routed {
                back,
                proxy,
                header,
                max_part_size,
            } => {
                let mut parts = Vec::with_capacity(body.len() + 1);
                parts.push(header.clone());
                parts.extend(body);
                // Checked here so that the worker sees the failure, not the router task.
                codec::check(&parts, *max_part_size)?;
                Ok(back.send((*proxy, parts)).is_ok())
            }
        }
    }
}

/// Request received by a responder
///
/// Exactly one reply is sent; later replies are ignored.
pub struct Request {
    requester: RequesterIdentity,
    first: Bytes,
    second: Option<Bytes>,
    route: ReplyRoute,
    replied: AtomicBool,
}

impl Request {
    pub(crate) fn new(
        requester: RequesterIdentity,
        first: Bytes,
        second: Option<Bytes>,
        route: ReplyRoute,
    ) -> Self {
        Self {
            requester,
            first,
            second,
            route,
            replied: AtomicBool::new(false),
        }
    }

    /// Application that sent the request
    pub fn requester(&self) -> &RequesterIdentity {
        &self.requester
    }

    /// Name of the requester application
    pub fn application_name(&self) -> &str {
        &self.requester.application_name
    }

    /// Id of the requester application
    pub fn application_id(&self) -> i32 {
        self.requester.application_id
    }

    /// Registry endpoint of the requester application
    pub fn server_endpoint(&self) -> &str {
        &self.requester.server_endpoint
    }

    /// Payload
    pub fn get(&self) -> &Bytes {
        &self.first
    }

    /// Payload as UTF-8 text
    pub fn get_string(&self) -> String {
        String::from_utf8_lossy(&self.first).into_owned()
    }

    /// Second payload part, for two-part requests
    pub fn second_part(&self) -> Option<&Bytes> {
        self.second.as_ref()
    }

    /// Reply with one part
    ///
    /// Returns false if a reply was already sent or the requester is gone.
    /// Fails with [`Error::MessageTooLarge`] if the requester would reject
    /// the reply; the request then counts as replied.
    pub fn reply(&self, data: impl Into<Bytes>) -> Result<bool> {
        self.send_reply(vec![ComsMessage::Response.to_part(), data.into()])
    }

    /// Reply with two parts
    pub fn reply_two_parts(&self, first: impl Into<Bytes>, second: impl Into<Bytes>) -> Result<bool> {
        self.send_reply(vec![
            ComsMessage::Response.to_part(),
            first.into(),
            second.into(),
        ])
    }

    /// Check if the reply was sent
    pub fn has_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    fn send_reply(&self, body: Vec<Bytes>) -> Result<bool> {
        if self.replied.swap(true, Ordering::AcqRel) {
            tracing::debug!(requester = %self.requester, "Request already replied");
            return Ok(false);
        }
        self.route.send(body)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("requester", &self.requester)
            .field("len", &self.first.len())
            .field("two_parts", &self.second.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_parts() -> Multipart {
        vec![
            Bytes::from_static(b"responder-x:1"),
            ComsMessage::Request {
                application_name: "req".into(),
                application_id: 5,
                server_endpoint: "tcp://localhost:7000".into(),
                server_proxy_port: 0,
            }
            .to_part(),
            Bytes::from_static(b"hello"),
        ]
    }

    #[test]
    fn test_decode_request() {
        match decode_incoming(&request_parts()).unwrap() {
            Incoming::Request {
                header,
                requester,
                first,
                second,
            } => {
                assert_eq!(&header[..], b"responder-x:1");
                assert_eq!(requester.application_id, 5);
                assert_eq!(requester.to_string(), "req.5@tcp://localhost:7000");
                assert_eq!(&first[..], b"hello");
                assert!(second.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_messages() {
        let sync = vec![Bytes::new(), ComsMessage::Sync.to_part()];
        assert!(matches!(decode_incoming(&sync).unwrap(), Incoming::Sync { .. }));

        let cancel = vec![Bytes::new(), ComsMessage::Cancel.to_part()];
        assert!(matches!(decode_incoming(&cancel).unwrap(), Incoming::Cancel { .. }));

        let mut missing_payload = request_parts();
        missing_payload.truncate(2);
        assert!(decode_incoming(&missing_payload).is_err());
        assert!(decode_incoming(&[Bytes::new()]).is_err());
    }

    fn routed_request(back: mpsc::UnboundedSender<(PeerId, Multipart)>) -> Request {
        Request::new(
            RequesterIdentity {
                application_name: "req".into(),
                application_id: 5,
                server_endpoint: "tcp://localhost:7000".into(),
                server_proxy_port: 0,
            },
            Bytes::from_static(b"ping"),
            None,
            ReplyRoute::Routed {
                back,
                proxy: PeerId(3),
                header: Bytes::from_static(b"id"),
                max_part_size: 1024,
            },
        )
    }

    #[tokio::test]
    async fn test_single_reply_through_route() {
        let (back, mut replies) = mpsc::unbounded_channel();
        let request = routed_request(back);

        assert!(request.reply("pong").unwrap());
        assert!(!request.reply("again").unwrap());
        assert!(request.has_replied());

        let (proxy, parts) = replies.recv().await.unwrap();
        assert_eq!(proxy, PeerId(3));
        assert_eq!(parts[0], Bytes::from_static(b"id"));
        assert_eq!(ComsMessage::from_part(&parts[1]).unwrap(), ComsMessage::Response);
        assert_eq!(parts[2], Bytes::from_static(b"pong"));
        assert!(replies.try_recv().is_err());
    }

    #[test]
    fn test_oversized_reply_not_routed() {
        let (back, mut replies) = mpsc::unbounded_channel();
        let request = routed_request(back);

        let result = request.reply(vec![0u8; 4096]);
        assert!(matches!(result, Err(Error::MessageTooLarge(_))));
        assert!(request.has_replied());
        assert!(replies.try_recv().is_err());
    }
}
