//! Subscriber
//!
//! Receives the stream of a publisher of another instance. The stream ends
//! when the publisher sends its end frame, when the connection drops, or
//! when the publishing instance reaches a terminal state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;

use crate::client::{Instance, KeyValueGetter, This};
use crate::error::{Error, Result};
use crate::protocol::constants::{record_key, string_id, PUBLISHER_KEY, PUBLISHER_RESPONDER_PREFIX};
use crate::protocol::message::{from_json_part, json_part, PublisherRecord, PublisherRequest};
use crate::protocol::{ComsMessage, Endpoint};
use crate::transport::{ControlHandle, SubSocket};
use crate::waiting::Waiting;

use super::requester::Requester;
use super::{cancel_frame, sleep_or_pending};

enum Received {
    Parts(Vec<Bytes>),
    Ended,
    Canceled,
    TimedOut,
}

/// Subscriber to a publisher of another instance
pub struct Subscriber {
    publisher_name: String,
    app_name: String,
    app_id: i32,
    endpoint: Endpoint,
    socket: SubSocket,
    control: ControlHandle,
    watcher: Instance,
    ended: AtomicBool,
    canceled: AtomicBool,
    timed_out: AtomicBool,
    timeout: StdMutex<Option<Duration>>,
    _waiting: Waiting,
}

impl Subscriber {
    /// Subscribe to the publisher `publisher_name` of `app`
    ///
    /// When the publisher expects a number of subscribers, creation blocks
    /// until the publisher has acknowledged this subscriber.
    pub async fn create(this: &Arc<This>, app: &Instance, publisher_name: &str) -> Result<Self> {
        let key = record_key(PUBLISHER_KEY, publisher_name);
        let getter = KeyValueGetter::new(app, key.clone());

        let record = match getter.get().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(Error::creation(format!(
                    "Subscriber to \"{}\" canceled during discovery",
                    publisher_name
                )))
            }
            Err(e) => {
                return Err(Error::creation(format!(
                    "Cannot find publisher \"{}\" of {}: {}",
                    publisher_name, app, e
                )))
            }
        };

        let record: PublisherRecord = from_json_part(record.as_bytes())?;
        let endpoint = app.endpoint().with_port(record.publisher_port);
        let config = app.server().config().clone();

        // Watch the publishing instance before connecting so that its
        // termination cannot be missed.
        let watcher = app.duplicate();
        watcher.refresh().await;

        let socket = match tokio::time::timeout(
            config.discovery_timeout,
            SubSocket::connect(&endpoint, config.max_part_size),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                return Err(Error::creation(format!(
                    "Cannot connect to publisher \"{}\" at {}: {}",
                    publisher_name, endpoint, e
                )))
            }
            Err(_) => {
                return Err(Error::creation(format!(
                    "Timeout connecting to publisher \"{}\" at {}",
                    publisher_name, endpoint
                )))
            }
        };
        socket.subscribe(string_id(&key, app.id()));

        if record.n_subscribers > 0 {
            synchronize(this, app, publisher_name).await?;
        }

        let control = socket.control();
        let waiting = {
            let control = control.clone();
            this.waiting().add(move || {
                control.send(cancel_frame());
            })
        };

        tracing::debug!(publisher = %publisher_name, endpoint = %endpoint, "Subscribed");

        Ok(Self {
            publisher_name: publisher_name.to_string(),
            app_name: app.name().to_string(),
            app_id: app.id(),
            endpoint,
            socket,
            control,
            watcher,
            ended: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            timeout: StdMutex::new(None),
            _waiting: waiting,
        })
    }

    /// Name of the publisher
    pub fn publisher_name(&self) -> &str {
        &self.publisher_name
    }

    /// Name of the publishing application
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Id of the publishing application
    pub fn app_id(&self) -> i32 {
        self.app_id
    }

    /// Set the timeout of `receive`, `None` waits forever
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        if let Ok(mut current) = self.timeout.lock() {
            *current = timeout;
        }
    }

    /// Receive the next published part
    ///
    /// Returns `None` at the end of the stream, when canceled or on timeout.
    pub async fn receive(&self) -> Option<Bytes> {
        self.receive_parts().await?.into_iter().next()
    }

    /// Receive the next two published parts
    pub async fn receive_two_parts(&self) -> Option<(Bytes, Bytes)> {
        let mut parts = self.receive_parts().await?.into_iter();
        let first = parts.next()?;
        Some((first, parts.next().unwrap_or_default()))
    }

    async fn receive_parts(&self) -> Option<Vec<Bytes>> {
        if self.has_ended() || self.is_canceled() {
            return None;
        }
        self.timed_out.store(false, Ordering::Release);

        let timeout = self.timeout.lock().ok().and_then(|t| *t);
        let deadline = sleep_or_pending(timeout);
        tokio::pin!(deadline);

        let received = loop {
            tokio::select! {
                biased;
                envelope = self.socket.recv() => {
                    let Some(envelope) = envelope else {
                        break Received::Ended;
                    };
                    if envelope.is_local() {
                        break Received::Canceled;
                    }

                    match envelope.parts.get(1).map(|p| ComsMessage::from_part(p)) {
                        Some(Ok(ComsMessage::Stream)) => {
                            break Received::Parts(envelope.parts.into_iter().skip(2).collect());
                        }
                        Some(Ok(ComsMessage::SyncStream)) => {}
                        Some(Ok(ComsMessage::StreamEnd)) => break Received::Ended,
                        other => {
                            tracing::warn!(publisher = %self.publisher_name, message = ?other, "Skipping unexpected stream frame");
                        }
                    }
                }
                state = self.watcher.wait_for() => {
                    if state.is_terminal() || self.watcher.is_closed() {
                        tracing::debug!(publisher = %self.publisher_name, state = %state, "Publishing application terminated");
                        break Received::Ended;
                    }
                    break Received::Canceled;
                }
                _ = &mut deadline => break Received::TimedOut,
            }
        };

        match received {
            Received::Parts(parts) => Some(parts),
            Received::Ended => {
                self.ended.store(true, Ordering::Release);
                None
            }
            Received::Canceled => {
                self.canceled.store(true, Ordering::Release);
                None
            }
            Received::TimedOut => {
                self.timed_out.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Unblock `receive` running in another task
    pub fn cancel(&self) {
        self.control.send(cancel_frame());
    }

    /// Check if the stream has ended
    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Check if the subscriber was canceled
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Check if the last `receive` timed out
    pub fn has_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sub.{}:{}.{}@{}",
            self.publisher_name, self.app_name, self.app_id, self.endpoint
        )
    }
}

/// Handshake with the companion responder of a counting publisher
async fn synchronize(this: &Arc<This>, app: &Instance, publisher_name: &str) -> Result<()> {
    let responder_name = format!("{}{}", PUBLISHER_RESPONDER_PREFIX, publisher_name);
    let requester = Requester::create(this, app, &responder_name).await?;

    requester
        .send(json_part(&PublisherRequest::SubscribePublisher)?)
        .await?;

    match requester.receive().await {
        Some(_) => Ok(()),
        None => Err(Error::creation(format!(
            "Subscription to publisher \"{}\" not acknowledged",
            publisher_name
        ))),
    }
}
