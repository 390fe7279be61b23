//! Communication patterns
//!
//! - `basic`: responder bound on its own port
//! - `multi`: responder router shared by several responder workers
//! - `requester`: client of either responder kind
//! - `publisher` / `subscriber`: fan-out stream with a counting handshake
//!
//! Every responder and publisher registers a discovery record in the
//! key-value store of its application; requesters and subscribers read it,
//! waiting for it if needed, then connect to the announced port.
//!
//! Data-plane messages are `[identity, control, payload...]` where
//! `identity` is `<record key>:<application id>` of the responder or
//! publisher and `control` is a [`ComsMessage`](crate::protocol::ComsMessage).

pub mod basic;
pub mod multi;
pub mod publisher;
pub mod request;
pub mod requester;
pub mod subscriber;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::client::{Server, This};
use crate::error::Result;
use crate::protocol::ComsMessage;

pub use publisher::Publisher;
pub use request::{Request, RequesterIdentity};
pub use requester::{Requester, RequesterOptions};
pub use subscriber::Subscriber;

/// Frame injected into a socket's inbound queue to unblock its receiver
pub(crate) fn cancel_frame() -> Vec<Bytes> {
    vec![ComsMessage::Cancel.to_part()]
}

/// Give back a leased port after a failed creation
///
/// The creation error is what the caller reports, a release failure is
/// only logged. Returns false if the registry refused the release.
pub(crate) async fn give_back_port(this: &This, port: u16) -> bool {
    match this.release_port(port).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(port = port, error = %e, "Failed to release port");
            false
        }
    }
}

/// Bind a socket on a port leased from the registry
///
/// Ports that cannot be bound are reported unavailable and another one is
/// leased, until the pool is exhausted.
pub(crate) async fn bind_leased<T, F, Fut>(this: &This, mut bind: F) -> Result<(T, u16)>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        let port = this.request_port().await?;

        match bind(port).await {
            Ok(socket) => return Ok((socket, port)),
            Err(e) => {
                tracing::warn!(port = port, error = %e, "Leased port unavailable");
                this.set_port_unavailable(port).await?;
            }
        }
    }
}

/// Future resolving after `timeout`, or never
pub(crate) async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Discovery record and leased port of a responder or publisher
///
/// Released explicitly with [`Registration::release`], or in a spawned task
/// when dropped inside a runtime. The spawned release is not awaited by
/// anyone: until it runs, the record still exists and creating the same
/// name fails with [`Error::Creation`](crate::error::Error::Creation).
pub(crate) struct Registration {
    server: Arc<Server>,
    id: i32,
    key: String,
    port: u16,
    publisher: Option<String>,
    released: AtomicBool,
}

impl Registration {
    pub(crate) fn new(server: Arc<Server>, id: i32, key: String, port: u16) -> Self {
        Self {
            server,
            id,
            key,
            port,
            publisher: None,
            released: AtomicBool::new(false),
        }
    }

    /// Also withdraw the publisher `name` on release
    pub(crate) fn with_publisher(mut self, name: impl Into<String>) -> Self {
        self.publisher = Some(name.into());
        self
    }

    pub(crate) async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        release(
            self.server.clone(),
            self.id,
            self.key.clone(),
            self.port,
            self.publisher.clone(),
        )
        .await;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(key = %self.key, "No runtime, discovery record left in place");
            return;
        };

        handle.spawn(release(
            self.server.clone(),
            self.id,
            self.key.clone(),
            self.port,
            self.publisher.take(),
        ));
    }
}

async fn release(server: Arc<Server>, id: i32, key: String, port: u16, publisher: Option<String>) {
    if let Err(e) = server.remove_key(id, &key).await {
        tracing::debug!(key = %key, error = %e, "Failed to remove discovery record");
    }
    if let Err(e) = server.release_port(id, port).await {
        tracing::debug!(port = port, error = %e, "Failed to release port");
    }
    if let Some(name) = publisher {
        if let Err(e) = server.terminate_publisher(id, &name).await {
            tracing::debug!(publisher = %name, error = %e, "Failed to terminate publisher");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::server::{RegistryServer, ServerConfig};

    #[tokio::test]
    async fn test_give_back_port_refused_twice() {
        let config = ServerConfig::with_addr("127.0.0.1:0".parse().unwrap()).port_range(41200, 10);
        let server = Arc::new(RegistryServer::bind(config).await.unwrap());
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        let config = ClientConfig::new(server.endpoint()).bind_host("127.0.0.1");
        let this = This::init(config, "leaser").await.unwrap();

        let port = this.request_port().await.unwrap();
        assert!(give_back_port(&this, port).await);
        assert!(!give_back_port(&this, port).await);

        this.terminate().await.unwrap();
        serving.abort();
    }
}
