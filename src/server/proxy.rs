//! Responder proxy
//!
//! Requesters configured with `use_proxy` connect to this endpoint instead of
//! the responder port. Every data-plane frame starts with the routing
//! identity `<record key>:<application id>` of its responder, which is enough
//! to find the responder port in the key-value store:
//!
//! ```text
//!   requester ──► front router ──(identity → port)──► responder
//!       ▲                                               │
//!       └──────────── same requester connection ◄───────┘
//! ```
//!
//! One backend connection is opened per requester connection and identity,
//! so replies go back on the connection the request came from.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::constants::parse_string_id;
use crate::protocol::message::{from_json_part, ResponderRecord};
use crate::protocol::Endpoint;
use crate::registry::ApplicationRegistry;
use crate::transport::{ControlHandle, DealerSocket, PeerId, RouterSocket};

type Routes = Arc<Mutex<HashMap<(PeerId, Bytes), Arc<DealerSocket>>>>;

/// Pass-through from requesters to the responders of attached applications
pub struct ResponderProxy {
    front: RouterSocket,
    registry: Arc<ApplicationRegistry>,
    responder_host: String,
    max_part_size: usize,
    routes: Routes,
}

impl ResponderProxy {
    /// Bind the front endpoint
    ///
    /// Responders are reached on the host of `addr`, loopback when it is
    /// unspecified.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ApplicationRegistry>,
        max_part_size: usize,
    ) -> Result<Self> {
        let front = RouterSocket::bind(addr, max_part_size).await?;

        let host = if addr.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            addr.ip()
        };

        Ok(Self {
            front,
            registry,
            responder_host: host.to_string(),
            max_part_size,
            routes: Arc::default(),
        })
    }

    /// Address requesters connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.front.local_addr()
    }

    /// Handle stopping `run` with a local message
    pub fn control(&self) -> ControlHandle {
        self.front.control()
    }

    /// Number of open backend connections
    pub fn route_count(&self) -> usize {
        self.routes.lock().map(|routes| routes.len()).unwrap_or(0)
    }

    /// Forward requests until the front socket closes or a local message
    /// arrives
    pub async fn run(&self) {
        while let Some(envelope) = self.front.recv().await {
            if envelope.is_local() {
                break;
            }

            let Some(identity) = envelope.first().cloned() else {
                continue;
            };

            if let Err(e) = self.forward(envelope.peer, identity, &envelope.parts).await {
                tracing::debug!(peer = %envelope.peer, error = %e, "Dropping proxied message");
            }
        }

        tracing::debug!(addr = %self.local_addr(), "Responder proxy stopped");
    }

    async fn forward(&self, peer: PeerId, identity: Bytes, parts: &[Bytes]) -> Result<()> {
        let key = (peer, identity);

        let existing = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(&key).cloned());

        let backend = match existing {
            Some(backend) if !backend.is_closed() => backend,
            _ => self.open_route(key).await?,
        };

        backend.send(parts).await
    }

    async fn open_route(&self, key: (PeerId, Bytes)) -> Result<Arc<DealerSocket>> {
        let (peer, identity) = key.clone();
        let port = self.resolve(&identity).await?;

        let endpoint = Endpoint::new(self.responder_host.clone(), port);
        let backend = Arc::new(DealerSocket::connect(&endpoint, self.max_part_size).await?);

        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(key.clone(), backend.clone());
        }

        let front = self.front.peers();
        let routes = self.routes.clone();
        let replies = backend.clone();
        tokio::spawn(async move {
            while let Some(envelope) = replies.recv().await {
                match front.send(peer, &envelope.parts) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Failed to forward proxied reply");
                    }
                }
            }

            if let Ok(mut routes) = routes.lock() {
                if routes.get(&key).is_some_and(|current| Arc::ptr_eq(current, &replies)) {
                    routes.remove(&key);
                }
            }
            tracing::debug!(peer = %peer, port = port, "Proxy route closed");
        });

        tracing::debug!(peer = %peer, port = port, "Proxy route opened");
        Ok(backend)
    }

    /// Responder port announced under a routing identity
    async fn resolve(&self, identity: &[u8]) -> Result<u16> {
        let identity = std::str::from_utf8(identity)
            .map_err(|_| Error::decode("routing identity is not UTF-8"))?;
        let (key, id) = parse_string_id(identity)
            .ok_or_else(|| Error::decode(format!("invalid routing identity {}", identity)))?;

        let record = self
            .registry
            .get_key_value(id, key)
            .await
            .map_err(|e| Error::Rejected {
                value: e.value(),
                message: e.to_string(),
            })?;

        let record: ResponderRecord = from_json_part(record.as_bytes())?;
        Ok(record.port)
    }
}
