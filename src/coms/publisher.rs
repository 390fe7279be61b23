//! Publisher
//!
//! Streams data to every connected subscriber. A publisher created with a
//! positive subscriber count can block until that many subscribers have
//! completed the handshake with its companion responder
//! `publisher:<name>`, so that no published data is lost by a late
//! subscriber.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;

use crate::client::This;
use crate::error::{Error, Result};
use crate::protocol::constants::{record_key, string_id, PUBLISHER_KEY, PUBLISHER_RESPONDER_PREFIX};
use crate::protocol::message::{from_json_part, PublisherRecord, PublisherRequest};
use crate::protocol::ComsMessage;
use crate::transport::PubSocket;
use crate::waiting::Waiting;

use super::basic::Responder;
use super::{bind_leased, give_back_port, Registration};

/// Cancellation of `wait_for_subscribers`, shared with the waiting set
#[derive(Default)]
struct SubscriberWait {
    canceled: AtomicBool,
    responder: StdMutex<Option<Arc<Responder>>>,
}

impl SubscriberWait {
    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        if let Some(responder) = self.responder() {
            responder.cancel();
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn responder(&self) -> Option<Arc<Responder>> {
        self.responder.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Publisher of the current application
///
/// Dropping it ends the stream at once but withdraws the name in the
/// background. Await [`terminate`](Publisher::terminate) before creating a
/// publisher with the same name again.
pub struct Publisher {
    this: Arc<This>,
    name: String,
    port: u16,
    n_subscribers: i32,
    identity: Bytes,
    socket: PubSocket,
    ended: AtomicBool,
    wait: Arc<SubscriberWait>,
    registration: Registration,
    _waiting: Waiting,
}

impl Publisher {
    /// Create the publisher `name` expecting `n_subscribers` subscribers
    ///
    /// Fails with [`Error::Creation`] if a publisher with the same name is
    /// already registered.
    pub async fn create(this: &Arc<This>, name: &str, n_subscribers: i32) -> Result<Self> {
        let config = this.server().config().clone();
        let key = record_key(PUBLISHER_KEY, name);

        let (socket, port) = bind_leased(this, |port| {
            PubSocket::bind(
                (config.bind_host.clone(), port),
                config.publisher_capacity,
                config.max_part_size,
            )
        })
        .await?;

        let record = serde_json::to_string(&PublisherRecord {
            publisher_port: port,
            n_subscribers,
        })?;

        match this.store_key_value(&key, &record).await {
            Ok(()) => {}
            Err(Error::KeyAlreadyExists(_)) => {
                drop(socket);
                this.release_port(port).await?;
                return Err(Error::creation(format!(
                    "A publisher with the name \"{}\" already exists",
                    name
                )));
            }
            Err(e) => {
                drop(socket);
                give_back_port(this, port).await;
                return Err(e);
            }
        }

        let registration =
            Registration::new(this.server().clone(), this.id(), key.clone(), port).with_publisher(name);

        this.server()
            .create_publisher(this.id(), name, n_subscribers)
            .await?;

        let wait = Arc::new(SubscriberWait::default());
        let waiting = {
            let wait = wait.clone();
            this.waiting().add(move || wait.cancel())
        };

        tracing::info!(publisher = %name, port = port, subscribers = n_subscribers, "Publisher created");

        Ok(Self {
            this: this.clone(),
            name: name.to_string(),
            port,
            n_subscribers,
            identity: Bytes::from(string_id(&key, this.id())),
            socket,
            ended: AtomicBool::new(false),
            wait,
            registration,
            _waiting: waiting,
        })
    }

    /// Publisher name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port subscribers connect to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of subscribers `wait_for_subscribers` waits for
    pub fn n_subscribers(&self) -> i32 {
        self.n_subscribers
    }

    /// Wait until the expected subscribers completed their handshake
    ///
    /// Returns `true` immediately when no subscriber is expected, `false`
    /// when canceled first.
    pub async fn wait_for_subscribers(&self) -> Result<bool> {
        if self.n_subscribers <= 0 {
            return Ok(true);
        }
        if self.wait.is_canceled() {
            return Ok(false);
        }

        let responder = match self.wait.responder() {
            Some(responder) => responder,
            None => {
                let name = format!("{}{}", PUBLISHER_RESPONDER_PREFIX, self.name);
                let responder = Arc::new(Responder::create(&self.this, &name).await?);
                if let Ok(mut slot) = self.wait.responder.lock() {
                    *slot = Some(responder.clone());
                }
                responder
            }
        };

        // Canceled while the responder was being created.
        if self.wait.is_canceled() {
            return Ok(false);
        }

        let mut counter = 0;
        while counter < self.n_subscribers {
            let Some(request) = responder.receive().await else {
                tracing::debug!(publisher = %self.name, subscribers = counter, "Wait for subscribers canceled");
                return Ok(false);
            };

            match from_json_part::<PublisherRequest>(request.get()) {
                Ok(PublisherRequest::SubscribePublisher) => {
                    counter += 1;
                    tracing::debug!(
                        publisher = %self.name,
                        subscriber = %request.requester(),
                        count = counter,
                        "Subscriber synchronized"
                    );
                }
                Err(e) => {
                    tracing::warn!(publisher = %self.name, error = %e, "Unexpected publisher request");
                }
            }

            if let Err(e) = request.reply("OK") {
                tracing::warn!(publisher = %self.name, error = %e, "Failed to answer subscriber");
            }
        }

        Ok(true)
    }

    /// Unblock `wait_for_subscribers` running in another task
    pub fn cancel_wait_for_subscribers(&self) {
        self.wait.cancel();
    }

    /// Check if the wait for subscribers was canceled
    pub fn is_wait_canceled(&self) -> bool {
        self.wait.is_canceled()
    }

    /// Number of connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.socket.subscriber_count()
    }

    /// Publish one part
    ///
    /// Fails with [`Error::MessageTooLarge`] if subscribers would reject the
    /// message; nothing is sent and the stream stays open.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.publish(vec![
            self.identity.clone(),
            ComsMessage::Stream.to_part(),
            data.into(),
        ])
    }

    /// Publish two parts
    pub fn send_two_parts(&self, first: impl Into<Bytes>, second: impl Into<Bytes>) -> Result<()> {
        self.publish(vec![
            self.identity.clone(),
            ComsMessage::Stream.to_part(),
            first.into(),
            second.into(),
        ])
    }

    /// Send a liveness frame that subscribers skip
    pub fn send_sync(&self) {
        if let Err(e) = self.publish(vec![self.identity.clone(), ComsMessage::SyncStream.to_part()]) {
            tracing::warn!(publisher = %self.name, error = %e, "Failed to send sync");
        }
    }

    /// End the stream, sent at most once
    pub fn send_end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        match self
            .socket
            .send(&[self.identity.clone(), ComsMessage::StreamEnd.to_part()])
        {
            Ok(_) => tracing::debug!(publisher = %self.name, "Stream ended"),
            Err(e) => tracing::warn!(publisher = %self.name, error = %e, "Failed to end stream"),
        }
    }

    /// Check if the stream was ended
    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// End the stream and withdraw the publisher from the registry
    ///
    /// Once this returns, the name can be used by a new publisher.
    pub async fn terminate(&self) {
        self.send_end();
        if let Some(responder) = self.wait.responder() {
            responder.terminate().await;
        }
        self.registration.release().await;
    }

    fn publish(&self, parts: Vec<Bytes>) -> Result<()> {
        if self.has_ended() {
            tracing::debug!(publisher = %self.name, "Publishing after end of stream");
        }
        let receivers = self.socket.send(&parts)?;
        tracing::trace!(publisher = %self.name, receivers = receivers, "Published");
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.send_end();
    }
}

impl fmt::Display for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pub.{}:{}.{}@{}",
            self.name,
            self.this.name(),
            self.this.id(),
            self.this.endpoint()
        )
    }
}
