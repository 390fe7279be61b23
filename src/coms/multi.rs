//! Multi responder
//!
//! A [`ResponderRouter`] owns the externally reachable socket and forwards
//! every request into a queue shared by any number of [`Responder`]
//! workers. Replies travel back through the router, which routes them to
//! the requester connection they came from:
//!
//! ```text
//!   requesters ──► front RouterSocket ──► shared queue ──► Responder workers
//!                        ▲                                     │
//!                        └──────────── back channel ◄──────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::client::This;
use crate::error::{Error, Result};
use crate::protocol::constants::{record_key, string_id, RESPONDER_KEY};
use crate::protocol::message::ResponderRecord;
use crate::transport::{ControlHandle, Multipart, PeerId, RouterSocket};
use crate::waiting::Waiting;

use super::request::{decode_incoming, send_ack, Incoming, ReplyRoute, Request, RequesterIdentity};
use super::{bind_leased, cancel_frame, give_back_port, Registration};

/// Request forwarded by the router to the workers
struct RoutedRequest {
    proxy: PeerId,
    header: Bytes,
    requester: RequesterIdentity,
    first: Bytes,
    second: Option<Bytes>,
}

type SharedQueue = Arc<Mutex<mpsc::UnboundedReceiver<RoutedRequest>>>;

/// Front end of a multi responder
///
/// Dropping it releases the name in the background. Await
/// [`terminate`](ResponderRouter::terminate) before creating a responder
/// with the same name again.
pub struct ResponderRouter {
    this: Arc<This>,
    name: String,
    port: u16,
    front: RouterSocket,
    control: ControlHandle,
    queue_tx: mpsc::UnboundedSender<RoutedRequest>,
    queue_rx: SharedQueue,
    back_tx: mpsc::UnboundedSender<(PeerId, Multipart)>,
    back_rx: Mutex<mpsc::UnboundedReceiver<(PeerId, Multipart)>>,
    canceled: AtomicBool,
    max_part_size: usize,
    registration: Registration,
    _waiting: Waiting,
}

impl ResponderRouter {
    /// Create the responder `name` of the current application
    pub async fn create(this: &Arc<This>, name: &str) -> Result<Self> {
        let config = this.server().config().clone();
        let key = record_key(RESPONDER_KEY, name);

        let (front, port) = bind_leased(this, |port| {
            RouterSocket::bind((config.bind_host.clone(), port), config.max_part_size)
        })
        .await?;

        let record = serde_json::to_string(&ResponderRecord { port })?;
        match this.store_key_value(&key, &record).await {
            Ok(()) => {}
            Err(Error::KeyAlreadyExists(_)) => {
                drop(front);
                this.release_port(port).await?;
                return Err(Error::creation(format!(
                    "A responder with the name \"{}\" already exists",
                    name
                )));
            }
            Err(e) => {
                drop(front);
                give_back_port(this, port).await;
                return Err(e);
            }
        }

        let control = front.control();
        let waiting = {
            let control = control.clone();
            this.waiting().add(move || {
                control.send(cancel_frame());
            })
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (back_tx, back_rx) = mpsc::unbounded_channel();

        tracing::info!(responder = %name, port = port, "Responder router created");

        Ok(Self {
            this: this.clone(),
            name: name.to_string(),
            port,
            front,
            control,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            back_tx,
            back_rx: Mutex::new(back_rx),
            canceled: AtomicBool::new(false),
            max_part_size: config.max_part_size,
            registration: Registration::new(this.server().clone(), this.id(), key, port),
            _waiting: waiting,
        })
    }

    /// Responder name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port requesters connect to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Routing identity requesters address
    pub fn identity(&self) -> String {
        string_id(&record_key(RESPONDER_KEY, &self.name), self.this.id())
    }

    /// Create a worker taking requests from this router
    pub fn create_responder(&self) -> Responder {
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let waiting = {
            let control_tx = control_tx.clone();
            self.this.waiting().add(move || {
                let _ = control_tx.send(());
            })
        };

        Responder {
            name: self.name.clone(),
            queue: self.queue_rx.clone(),
            back: self.back_tx.clone(),
            control_tx,
            control_rx: Mutex::new(control_rx),
            canceled: AtomicBool::new(false),
            max_part_size: self.max_part_size,
            _waiting: waiting,
        }
    }

    /// Forward requests to the workers and replies to the requesters
    ///
    /// Runs until canceled.
    pub async fn run(&self) {
        let mut back = self.back_rx.lock().await;

        loop {
            tokio::select! {
                envelope = self.front.recv() => {
                    let Some(envelope) = envelope else { break };

                    if envelope.is_local() {
                        break;
                    }

                    match decode_incoming(&envelope.parts) {
                        Ok(Incoming::Request { header, requester, first, second }) => {
                            let routed = RoutedRequest {
                                proxy: envelope.peer,
                                header,
                                requester,
                                first,
                                second,
                            };
                            if self.queue_tx.send(routed).is_err() {
                                break;
                            }
                        }
                        Ok(Incoming::Sync { header }) => {
                            send_ack(&self.front, envelope.peer, header);
                        }
                        Ok(Incoming::Cancel { header }) => {
                            send_ack(&self.front, envelope.peer, header);
                            break;
                        }
                        Ok(Incoming::Other(message)) => {
                            tracing::debug!(responder = %self.name, message = ?message, "Ignoring unexpected message");
                        }
                        Err(e) => {
                            tracing::warn!(responder = %self.name, error = %e, "Skipping malformed request");
                        }
                    }
                }
                reply = back.recv() => {
                    if let Some((proxy, parts)) = reply {
                        if let Err(e) = self.front.send_to(proxy, &parts) {
                            tracing::warn!(responder = %self.name, error = %e, "Failed to forward reply");
                        }
                    }
                }
            }
        }

        self.canceled.store(true, Ordering::Release);
        tracing::debug!(responder = %self.name, "Responder router stopped");
    }

    /// Stop `run` from another task
    pub fn cancel(&self) {
        self.control.send(cancel_frame());
    }

    /// Check if the router was canceled
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Remove the discovery record and give the port back
    ///
    /// Once this returns, the name can be used by a new responder.
    pub async fn terminate(&self) {
        self.registration.release().await;
    }
}

impl fmt::Display for ResponderRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rep.{}:{}.{}@{}",
            self.name,
            self.this.name(),
            self.this.id(),
            self.this.endpoint()
        )
    }
}

/// Worker of a [`ResponderRouter`]
pub struct Responder {
    name: String,
    queue: SharedQueue,
    back: mpsc::UnboundedSender<(PeerId, Multipart)>,
    control_tx: mpsc::UnboundedSender<()>,
    control_rx: Mutex<mpsc::UnboundedReceiver<()>>,
    canceled: AtomicBool,
    max_part_size: usize,
    _waiting: Waiting,
}

impl Responder {
    /// Name of the router
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next request forwarded by the router
    ///
    /// Returns `None` once canceled or when the router is gone.
    pub async fn receive(&self) -> Option<Request> {
        if self.is_canceled() {
            return None;
        }

        let mut control = self.control_rx.lock().await;

        let routed = tokio::select! {
            biased;
            _ = control.recv() => {
                self.canceled.store(true, Ordering::Release);
                return None;
            }
            routed = async { self.queue.lock().await.recv().await } => routed?,
        };

        let route = ReplyRoute::Routed {
            back: self.back.clone(),
            proxy: routed.proxy,
            header: routed.header,
            max_part_size: self.max_part_size,
        };
        Some(Request::new(routed.requester, routed.first, routed.second, route))
    }

    /// Unblock `receive` running in another task
    pub fn cancel(&self) {
        let _ = self.control_tx.send(());
    }

    /// Check if the worker was canceled
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}
