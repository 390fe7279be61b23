//! Basic responder
//!
//! Binds its own router socket on a leased port and replies directly on the
//! connection each request arrived on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::client::This;
use crate::error::{Error, Result};
use crate::protocol::constants::{record_key, string_id, RESPONDER_KEY};
use crate::protocol::message::ResponderRecord;
use crate::transport::{ControlHandle, RouterSocket};
use crate::waiting::Waiting;

use super::request::{decode_incoming, send_ack, Incoming, ReplyRoute, Request};
use super::{bind_leased, cancel_frame, give_back_port, Registration};

/// Responder serving requests one at a time
///
/// Dropping it releases the name in the background. Await
/// [`terminate`](Responder::terminate) before creating a responder with the
/// same name again.
pub struct Responder {
    this: Arc<This>,
    name: String,
    port: u16,
    socket: RouterSocket,
    control: ControlHandle,
    canceled: AtomicBool,
    registration: Registration,
    _waiting: Waiting,
}

impl Responder {
    /// Create the responder `name` of the current application
    ///
    /// Fails with [`Error::Creation`] if a responder with the same name is
    /// already registered.
    pub async fn create(this: &Arc<This>, name: &str) -> Result<Self> {
        let config = this.server().config().clone();
        let key = record_key(RESPONDER_KEY, name);

        let (socket, port) = bind_leased(this, |port| {
            RouterSocket::bind((config.bind_host.clone(), port), config.max_part_size)
        })
        .await?;

        let record = serde_json::to_string(&ResponderRecord { port })?;
        match this.store_key_value(&key, &record).await {
            Ok(()) => {}
            Err(Error::KeyAlreadyExists(_)) => {
                drop(socket);
                this.release_port(port).await?;
                return Err(Error::creation(format!(
                    "A responder with the name \"{}\" already exists",
                    name
                )));
            }
            Err(e) => {
                drop(socket);
                give_back_port(this, port).await;
                return Err(e);
            }
        }

        let control = socket.control();
        let waiting = {
            let control = control.clone();
            this.waiting().add(move || {
                control.send(cancel_frame());
            })
        };

        tracing::info!(responder = %name, port = port, "Responder created");

        Ok(Self {
            this: this.clone(),
            name: name.to_string(),
            port,
            socket,
            control,
            canceled: AtomicBool::new(false),
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

    /// Wait for the next request
    ///
    /// Sync messages are acknowledged without being returned. Returns `None`
    /// once canceled.
    pub async fn receive(&self) -> Option<Request> {
        if self.is_canceled() {
            return None;
        }

        loop {
            let envelope = self.socket.recv().await?;

            if envelope.is_local() {
                self.canceled.store(true, Ordering::Release);
                return None;
            }

            match decode_incoming(&envelope.parts) {
                Ok(Incoming::Request {
                    header,
                    requester,
                    first,
                    second,
                }) => {
                    let route = ReplyRoute::Direct {
                        peers: self.socket.peers(),
                        peer: envelope.peer,
                        header,
                    };
                    return Some(Request::new(requester, first, second, route));
                }
                Ok(Incoming::Sync { header }) => {
                    send_ack(&self.socket, envelope.peer, header);
                }
                Ok(Incoming::Cancel { header }) => {
                    self.canceled.store(true, Ordering::Release);
                    send_ack(&self.socket, envelope.peer, header);
                    return None;
                }
                Ok(Incoming::Other(message)) => {
                    tracing::debug!(responder = %self.name, message = ?message, "Ignoring unexpected message");
                }
                Err(e) => {
                    tracing::warn!(responder = %self.name, error = %e, "Skipping malformed request");
                }
            }
        }
    }

    /// Unblock `receive` running in another task
    pub fn cancel(&self) {
        self.control.send(cancel_frame());
    }

    /// Check if the responder was canceled
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

impl fmt::Display for Responder {
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
