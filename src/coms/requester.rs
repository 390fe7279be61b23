//! Requester
//!
//! Connects to a basic responder or a responder router of another
//! instance. Creation waits for the responder to be registered, then
//! synchronizes with it before the first request:
//!
//! ```text
//!   read record ──(absent)──► wait KEYVALUE event ──► read record
//!        │
//!        ▼
//!   connect ──► sync ──(no ack within t)──► reconnect, t += interval
//!                 │
//!                 ▼
//!               ready
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::{ClientConfig, Instance, KeyValueGetter, This};
use crate::error::{Error, Result};
use crate::protocol::constants::{record_key, string_id, RESPONDER_KEY};
use crate::protocol::message::{from_json_part, ResponderRecord};
use crate::protocol::{ComsMessage, Endpoint};
use crate::state::State;
use crate::transport::{codec, DealerSocket};
use crate::waiting::Waiting;

use super::sleep_or_pending;

/// Options of [`Requester::create_with`]
#[derive(Debug, Clone, Default)]
pub struct RequesterOptions {
    /// Timeout of `receive`, none by default
    pub timeout: Option<Duration>,
    /// Cancel the requester when the responder application fails
    pub check_app: bool,
}

impl RequesterOptions {
    /// Set the receive timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Watch the responder application
    pub fn check_app(mut self) -> Self {
        self.check_app = true;
        self
    }
}

enum Received {
    Parts(Vec<Bytes>),
    Canceled,
    TimedOut,
    Closed,
}

/// Client of a responder
pub struct Requester {
    this: Arc<This>,
    app_name: String,
    app_id: i32,
    responder_name: String,
    identity: Bytes,
    endpoint: Endpoint,
    proxy_port: u16,
    config: ClientConfig,
    socket: Mutex<Option<DealerSocket>>,
    control_tx: mpsc::UnboundedSender<()>,
    control_rx: Mutex<mpsc::UnboundedReceiver<()>>,
    canceled: Arc<AtomicBool>,
    timed_out: AtomicBool,
    timeout: StdMutex<Option<Duration>>,
    checker: Option<JoinHandle<()>>,
    _waiting: Waiting,
}

impl Requester {
    /// Create a requester to the responder `responder_name` of `app`
    pub async fn create(this: &Arc<This>, app: &Instance, responder_name: &str) -> Result<Self> {
        Self::create_with(this, app, responder_name, RequesterOptions::default()).await
    }

    /// Create a requester with options
    ///
    /// Fails with [`Error::Creation`] if the responder cannot be found
    /// before `app` terminates, or if it does not answer the
    /// synchronization within the discovery timeout.
    pub async fn create_with(
        this: &Arc<This>,
        app: &Instance,
        responder_name: &str,
        options: RequesterOptions,
    ) -> Result<Self> {
        let key = record_key(RESPONDER_KEY, responder_name);
        let getter = KeyValueGetter::new(app, key.clone());

        let record = match getter.get().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(Error::creation(format!(
                    "Requester to \"{}\" canceled during discovery",
                    responder_name
                )))
            }
            Err(e) => {
                return Err(Error::creation(format!(
                    "Cannot find responder \"{}\" of {}: {}",
                    responder_name, app, e
                )))
            }
        };

        let record: ResponderRecord = from_json_part(record.as_bytes())?;
        let identity = Bytes::from(string_id(&key, app.id()));
        let config = app.server().config().clone();

        // Through the proxy, the responder is reached on the registry host.
        let (endpoint, proxy_port) = if config.use_proxy {
            let port = app.server().responder_proxy_port().await?;
            (app.endpoint().with_port(port), port)
        } else {
            (app.endpoint().with_port(record.port), 0)
        };

        let socket = connect_and_sync(&endpoint, &identity, &config)
            .await
            .map_err(|e| {
                Error::creation(format!(
                    "Cannot synchronize with responder \"{}\" at {}: {}",
                    responder_name, endpoint, e
                ))
            })?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let canceled = Arc::new(AtomicBool::new(false));

        let waiting = {
            let control_tx = control_tx.clone();
            let canceled = canceled.clone();
            this.waiting().add(move || {
                canceled.store(true, Ordering::Release);
                let _ = control_tx.send(());
            })
        };

        let checker = options.check_app.then(|| {
            let watcher = app.duplicate();
            let control_tx = control_tx.clone();
            let canceled = canceled.clone();
            tokio::spawn(async move {
                watcher.refresh().await;
                if watcher.wait_for_states(State::Failure.into()).await == State::Failure {
                    tracing::debug!(app = %watcher.name(), "Responder application failed");
                    canceled.store(true, Ordering::Release);
                    let _ = control_tx.send(());
                }
            })
        });

        tracing::debug!(responder = %responder_name, endpoint = %endpoint, "Requester synchronized");

        Ok(Self {
            this: this.clone(),
            app_name: app.name().to_string(),
            app_id: app.id(),
            responder_name: responder_name.to_string(),
            identity,
            endpoint,
            proxy_port,
            config,
            socket: Mutex::new(Some(socket)),
            control_tx,
            control_rx: Mutex::new(control_rx),
            canceled,
            timed_out: AtomicBool::new(false),
            timeout: StdMutex::new(options.timeout),
            checker,
            _waiting: waiting,
        })
    }

    /// Name of the responder
    pub fn responder_name(&self) -> &str {
        &self.responder_name
    }

    /// Name of the responder application
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Id of the responder application
    pub fn app_id(&self) -> i32 {
        self.app_id
    }

    /// Set the timeout of `receive`, `None` waits forever
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        if let Ok(mut current) = self.timeout.lock() {
            *current = timeout;
        }
    }

    /// Send a request
    ///
    /// Fails with [`Error::MessageTooLarge`] before touching the connection
    /// if the responder would reject the request.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_parts(vec![data.into()]).await
    }

    /// Send a two-part request
    pub async fn send_two_parts(&self, first: impl Into<Bytes>, second: impl Into<Bytes>) -> Result<()> {
        self.send_parts(vec![first.into(), second.into()]).await
    }

    async fn send_parts(&self, payload: Vec<Bytes>) -> Result<()> {
        self.timed_out.store(false, Ordering::Release);

        let control = ComsMessage::Request {
            application_name: self.this.name().to_string(),
            application_id: self.this.id(),
            server_endpoint: self.this.endpoint().to_string(),
            server_proxy_port: self.proxy_port,
        };

        let mut parts = Vec::with_capacity(payload.len() + 2);
        parts.push(self.identity.clone());
        parts.push(control.to_part());
        parts.extend(payload);
        codec::check(&parts, self.config.max_part_size)?;

        let mut slot = self.socket.lock().await;

        // The connection is dropped after a timeout, synchronize again.
        let socket = match slot.take() {
            Some(socket) => socket,
            None => match connect_and_sync(&self.endpoint, &self.identity, &self.config).await {
                Ok(socket) => socket,
                Err(Error::Timeout) => {
                    self.timed_out.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        socket.send(&parts).await?;
        *slot = Some(socket);
        Ok(())
    }

    /// Receive the response
    ///
    /// Returns `None` when canceled, on timeout (see [`has_timed_out`])
    /// or when the responder is gone.
    ///
    /// [`has_timed_out`]: Requester::has_timed_out
    pub async fn receive(&self) -> Option<Bytes> {
        self.receive_parts().await?.into_iter().next()
    }

    /// Receive a two-part response, the second part is empty for one-part
    /// responses
    pub async fn receive_two_parts(&self) -> Option<(Bytes, Bytes)> {
        let mut parts = self.receive_parts().await?.into_iter();
        let first = parts.next()?;
        Some((first, parts.next().unwrap_or_default()))
    }

    async fn receive_parts(&self) -> Option<Vec<Bytes>> {
        if self.is_canceled() {
            return None;
        }

        let mut slot = self.socket.lock().await;
        let mut control = self.control_rx.lock().await;
        let timeout = self.timeout.lock().ok().and_then(|t| *t);
        let deadline = sleep_or_pending(timeout);
        tokio::pin!(deadline);

        let received = match slot.as_ref() {
            None => Received::Closed,
            Some(socket) => loop {
                let envelope = tokio::select! {
                    biased;
                    _ = control.recv() => break Received::Canceled,
                    _ = &mut deadline => break Received::TimedOut,
                    envelope = socket.recv() => envelope,
                };

                let Some(envelope) = envelope else {
                    break Received::Closed;
                };

                let control_part = envelope.parts.get(1).map(|p| ComsMessage::from_part(p));
                match control_part {
                    Some(Ok(ComsMessage::Response)) => {
                        break Received::Parts(envelope.parts.into_iter().skip(2).collect());
                    }
                    // Late sync acknowledgements.
                    Some(Ok(ComsMessage::Ack)) => {}
                    other => {
                        tracing::debug!(responder = %self.responder_name, message = ?other, "Ignoring unexpected reply");
                    }
                }
            },
        };

        match received {
            Received::Parts(parts) => Some(parts),
            Received::Canceled => {
                self.canceled.store(true, Ordering::Release);
                None
            }
            Received::TimedOut => {
                self.timed_out.store(true, Ordering::Release);
                *slot = None;
                None
            }
            Received::Closed => {
                *slot = None;
                None
            }
        }
    }

    /// Unblock `receive` running in another task
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        let _ = self.control_tx.send(());
    }

    /// Check if the requester was canceled
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Check if the last `receive` timed out
    pub fn has_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        if let Some(checker) = self.checker.take() {
            checker.abort();
        }
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "req.{}:{}.{}@{}",
            self.responder_name, self.app_name, self.app_id, self.endpoint
        )
    }
}

/// Connect and exchange a sync message, retrying with growing timeouts
async fn connect_and_sync(endpoint: &Endpoint, identity: &Bytes, config: &ClientConfig) -> Result<DealerSocket> {
    let deadline = Instant::now() + config.discovery_timeout;
    let mut wait = config.sync_interval;
    let sync = [identity.clone(), ComsMessage::Sync.to_part()];

    loop {
        match DealerSocket::connect(endpoint, config.max_part_size).await {
            Ok(socket) => {
                socket.send(&sync).await?;
                if let Ok(Some(_ack)) = tokio::time::timeout(wait, socket.recv()).await {
                    return Ok(socket);
                }
            }
            Err(e) => {
                tracing::debug!(endpoint = %endpoint, error = %e, "Responder not reachable yet");
                tokio::time::sleep(wait).await;
            }
        }

        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        wait += config.sync_interval;
    }
}
