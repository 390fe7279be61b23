//! Current application context
//!
//! [`This`] is the registration of the running process in the registry. It
//! is created once with [`This::init`] and passed explicitly (as an `Arc`) to
//! the patterns that need the identity of the caller.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::protocol::Endpoint;
use crate::state::State;
use crate::waiting::WaitingSet;

use super::config::ClientConfig;
use super::instance::Instance;
use super::server::Server;

/// Registration of the current process
pub struct This {
    server: Arc<Server>,
    name: String,
    id: i32,
    waiting: Arc<WaitingSet>,
    stop_handler: Mutex<Option<JoinHandle<()>>>,
}

impl This {
    /// Connect to the registry and attach the current process as `name`
    pub async fn init(config: ClientConfig, name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let waiting = WaitingSet::new();
        let server = Server::open_with_waiting(config, waiting.clone()).await?;

        let id = server
            .attach_unregistered(&name, Some(std::process::id()))
            .await?;

        tracing::info!(app = %name, id = id, endpoint = %server.endpoint(), "Application attached");

        Ok(Arc::new(Self {
            server,
            name,
            id,
            waiting,
            stop_handler: Mutex::new(None),
        }))
    }

    /// Application name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Application id
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Registry endpoint
    pub fn endpoint(&self) -> &Endpoint {
        self.server.endpoint()
    }

    /// Registry connection
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Blocking operations of this process
    pub fn waiting(&self) -> &Arc<WaitingSet> {
        &self.waiting
    }

    /// Handle on this process as seen by the registry
    pub async fn instance(&self) -> Result<Instance> {
        self.server.connect_with_id(self.id).await
    }

    /// Report the RUNNING state
    pub async fn set_running(&self) -> Result<()> {
        self.server.set_status(self.id, State::Running).await
    }

    /// Publish the result of this process
    pub async fn set_result(&self, data: impl Into<Bytes>) -> Result<()> {
        self.server.set_result(self.id, data.into()).await
    }

    /// Store a key in the key-value store of this process
    pub async fn store_key_value(&self, key: &str, value: &str) -> Result<()> {
        self.server.store_key_value(self.id, key, value).await
    }

    /// Read a key of this process
    pub async fn get_key_value(&self, key: &str) -> Result<String> {
        self.server.get_key_value(self.id, key).await
    }

    /// Remove a key of this process
    pub async fn remove_key(&self, key: &str) -> Result<()> {
        self.server.remove_key(self.id, key).await
    }

    /// Lease a port
    pub async fn request_port(&self) -> Result<u16> {
        self.server.request_port(self.id, None).await
    }

    /// Lease a port announced as `name`
    pub async fn request_named_port(&self, name: &str) -> Result<u16> {
        self.server.request_port(self.id, Some(name)).await
    }

    /// Report a leased port that could not be bound
    pub async fn set_port_unavailable(&self, port: u16) -> Result<()> {
        self.server.set_port_unavailable(self.id, port).await
    }

    /// Give a leased port back
    pub async fn release_port(&self, port: u16) -> Result<()> {
        self.server.release_port(self.id, port).await
    }

    /// Run `callback` once the registry asks this process to stop
    ///
    /// `stopping_time` is the number of seconds the registry waits before
    /// killing the process.
    pub async fn handle_stop<F>(&self, callback: F, stopping_time: i32) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.server.set_stop_handler(self.id, stopping_time).await?;
        let instance = self.instance().await?;

        let task = tokio::spawn(async move {
            // A cancel_all also wakes this wait, keep watching afterwards.
            loop {
                let state = instance.wait_for_states(State::Stopping.into()).await;
                if instance.past_states().contains(State::Stopping) {
                    tracing::info!(app = %instance.name(), id = instance.id(), "Stop requested");
                    callback();
                    break;
                }
                if state.is_terminal() || instance.is_closed() {
                    break;
                }
            }
        });

        if let Ok(mut slot) = self.stop_handler.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }

        Ok(())
    }

    /// Cancel every blocking operation of this process
    pub fn cancel_all(&self) {
        self.waiting.cancel_all();
    }

    /// Detach from the registry
    ///
    /// The registry reports STOPPED if a stop was requested, SUCCESS
    /// otherwise.
    pub async fn terminate(&self) -> Result<()> {
        if let Ok(mut slot) = self.stop_handler.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        self.server.detach_unregistered(self.id).await?;
        tracing::info!(app = %self.name, id = self.id, "Application detached");
        Ok(())
    }
}

impl Drop for This {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.stop_handler.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
