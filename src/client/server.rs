//! Registry connection
//!
//! A [`Server`] owns the request socket to the registry and the event
//! dispatcher reading its push stream. Every registry operation used by the
//! patterns is an async method here.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::event::{EventDispatcher, EventListener, ListenerRegistration};
use crate::protocol::message::{ApplicationInfo, StatusBody};
use crate::protocol::{Endpoint, RegistryRequest};
use crate::state::{State, StateMask};
use crate::waiting::WaitingSet;

use super::config::ClientConfig;
use super::instance::Instance;
use super::request_socket::RequestSocket;

/// Connection to a registry
pub struct Server {
    config: ClientConfig,
    requests: RequestSocket,
    dispatcher: EventDispatcher,
    waiting: Arc<WaitingSet>,
}

impl Server {
    /// Connect to the registry at `config.endpoint`
    pub async fn open(config: ClientConfig) -> Result<Arc<Self>> {
        Self::open_with_waiting(config, WaitingSet::new()).await
    }

    /// Connect, registering blocking operations in an existing waiting set
    pub async fn open_with_waiting(config: ClientConfig, waiting: Arc<WaitingSet>) -> Result<Arc<Self>> {
        let requests = RequestSocket::new(
            config.endpoint.clone(),
            config.request_timeout,
            config.max_part_size,
        );

        let response = requests
            .request_checked(&RegistryRequest::EventPort, "event port")
            .await?;
        let port = u16::try_from(response.value)
            .map_err(|_| Error::decode(format!("invalid event port {}", response.value)))?;

        let event_endpoint = config.endpoint.with_port(port);
        let dispatcher = EventDispatcher::connect(&event_endpoint, config.max_part_size).await?;

        tracing::info!(endpoint = %config.endpoint, event_port = port, "Connected to registry");

        Ok(Arc::new(Self {
            config,
            requests,
            dispatcher,
            waiting,
        }))
    }

    /// Registry endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Waiting set of the blocking operations using this connection
    pub fn waiting(&self) -> &Arc<WaitingSet> {
        &self.waiting
    }

    /// Register an event listener on the push stream
    pub fn register_listener(&self, listener: Arc<EventListener>) -> ListenerRegistration {
        self.dispatcher.register(listener)
    }

    /// Check that the registry answers
    pub async fn is_available(&self) -> bool {
        self.requests.request(&RegistryRequest::Sync).await.is_ok()
    }

    /// Stop the event dispatcher, every listener then sees end-of-stream
    pub fn cancel(&self) {
        self.dispatcher.cancel();
    }

    /// Register an application that was not started by the registry
    pub async fn attach_unregistered(&self, name: &str, pid: Option<u32>) -> Result<i32> {
        let response = self
            .requests
            .request_checked(
                &RegistryRequest::AttachUnregistered {
                    name: name.to_string(),
                    pid,
                },
                name,
            )
            .await?;

        i32::try_from(response.value)
            .map_err(|_| Error::decode(format!("invalid application id {}", response.value)))
    }

    /// Remove an attached application
    pub async fn detach_unregistered(&self, id: i32) -> Result<()> {
        self.requests
            .request_checked(&RegistryRequest::DetachUnregistered { id }, &id.to_string())
            .await?;
        Ok(())
    }

    /// Ask the registry to launch an application
    ///
    /// The embedded registry does not launch processes and rejects this.
    pub async fn start(self: &Arc<Self>, name: &str, args: &[String]) -> Result<Instance> {
        let response = self
            .requests
            .request_checked(
                &RegistryRequest::Start {
                    name: name.to_string(),
                    args: args.to_vec(),
                },
                name,
            )
            .await?;

        let id = i32::try_from(response.value)
            .map_err(|_| Error::decode(format!("invalid application id {}", response.value)))?;
        self.connect_with_id(id).await
    }

    /// Instances of the application `name`
    pub async fn connect(self: &Arc<Self>, name: &str) -> Result<Vec<Instance>> {
        let response = self
            .requests
            .request_checked(&RegistryRequest::Connect { name: name.to_string() }, name)
            .await?;
        let infos: Vec<ApplicationInfo> = response.body()?;

        let mut instances = Vec::with_capacity(infos.len());
        for info in &infos {
            instances.push(Instance::attach(self.clone(), info).await);
        }

        Ok(instances)
    }

    /// Instance with id `id`
    pub async fn connect_with_id(self: &Arc<Self>, id: i32) -> Result<Instance> {
        let response = self
            .requests
            .request_checked(&RegistryRequest::ConnectWithId { id }, &id.to_string())
            .await?;
        let info: ApplicationInfo = response.body()?;

        Ok(Instance::attach(self.clone(), &info).await)
    }

    /// Every instance known to the registry
    pub async fn list(&self) -> Result<Vec<ApplicationInfo>> {
        let response = self
            .requests
            .request_checked(&RegistryRequest::List, "list")
            .await?;
        response.body()
    }

    /// Request a graceful stop
    pub async fn stop(&self, id: i32) -> Result<()> {
        self.requests
            .request_checked(&RegistryRequest::Stop { id }, &id.to_string())
            .await?;
        Ok(())
    }

    /// Kill an instance
    pub async fn kill(&self, id: i32) -> Result<()> {
        self.requests
            .request_checked(&RegistryRequest::Kill { id }, &id.to_string())
            .await?;
        Ok(())
    }

    /// Port of the registry's responder proxy, on the registry host
    pub async fn responder_proxy_port(&self) -> Result<u16> {
        let response = self
            .requests
            .request_checked(&RegistryRequest::ResponderProxyPort, "responder proxy port")
            .await?;
        u16::try_from(response.value)
            .map_err(|_| Error::decode(format!("invalid responder proxy port {}", response.value)))
    }

    /// Check if an instance is alive
    pub async fn is_alive(&self, id: i32) -> Result<bool> {
        let response = self
            .requests
            .request_checked(&RegistryRequest::IsAlive { id }, &id.to_string())
            .await?;
        Ok(response.value == 1)
    }

    /// Status of an instance as known by the registry
    pub async fn status(&self, id: i32) -> Result<StatusBody> {
        let response = self
            .requests
            .request_checked(&RegistryRequest::GetStatus { id }, &id.to_string())
            .await?;
        response.body()
    }

    /// Current state of an instance
    pub async fn actual_state(&self, id: i32) -> Result<State> {
        Ok(State::from_bits(self.status(id).await?.application_state))
    }

    /// Every state an instance has been in
    pub async fn past_states(&self, id: i32) -> Result<StateMask> {
        Ok(StateMask::from_bits(self.status(id).await?.past_application_states))
    }

    /// Update the state of an instance
    pub async fn set_status(&self, id: i32, state: State) -> Result<()> {
        self.requests
            .request_checked(
                &RegistryRequest::SetStatus {
                    id,
                    state: state.bits(),
                },
                &id.to_string(),
            )
            .await?;
        Ok(())
    }

    /// Publish the result of an instance
    pub async fn set_result(&self, id: i32, data: Bytes) -> Result<()> {
        let response = self
            .requests
            .request_with_data(&RegistryRequest::SetResult { id }, data)
            .await?;
        super::request_socket::check(response, &id.to_string())?;
        Ok(())
    }

    /// Store a key, fails with [`Error::KeyAlreadyExists`] if present
    pub async fn store_key_value(&self, id: i32, key: &str, value: &str) -> Result<()> {
        self.requests
            .request_checked(
                &RegistryRequest::StoreKeyValue {
                    id,
                    key: key.to_string(),
                    value: value.to_string(),
                },
                key,
            )
            .await?;
        Ok(())
    }

    /// Read a key, fails with [`Error::KeyNotFound`] if absent
    pub async fn get_key_value(&self, id: i32, key: &str) -> Result<String> {
        let response = self
            .requests
            .request_checked(
                &RegistryRequest::GetKeyValue {
                    id,
                    key: key.to_string(),
                },
                key,
            )
            .await?;
        response.body()
    }

    /// Remove a key, fails with [`Error::KeyNotFound`] if absent
    pub async fn remove_key(&self, id: i32, key: &str) -> Result<()> {
        self.requests
            .request_checked(
                &RegistryRequest::RemoveKey {
                    id,
                    key: key.to_string(),
                },
                key,
            )
            .await?;
        Ok(())
    }

    /// Lease a port, announcing it with a `PORT` event when named
    pub async fn request_port(&self, id: i32, name: Option<&str>) -> Result<u16> {
        let response = self
            .requests
            .request_checked(
                &RegistryRequest::RequestPort {
                    id,
                    name: name.map(str::to_string),
                },
                &id.to_string(),
            )
            .await?;

        u16::try_from(response.value)
            .map_err(|_| Error::decode(format!("invalid port {}", response.value)))
    }

    /// Report a leased port that could not be bound
    pub async fn set_port_unavailable(&self, id: i32, port: u16) -> Result<()> {
        self.requests
            .request_checked(&RegistryRequest::PortUnavailable { id, port }, &id.to_string())
            .await?;
        Ok(())
    }

    /// Give a leased port back
    pub async fn release_port(&self, id: i32, port: u16) -> Result<()> {
        self.requests
            .request_checked(&RegistryRequest::ReleasePort { id, port }, &id.to_string())
            .await?;
        Ok(())
    }

    /// Announce a publisher with a `PUBLISHER` event
    pub async fn create_publisher(&self, id: i32, name: &str, n_subscribers: i32) -> Result<()> {
        self.requests
            .request_checked(
                &RegistryRequest::CreatePublisher {
                    id,
                    name: name.to_string(),
                    n_subscribers,
                },
                name,
            )
            .await?;
        Ok(())
    }

    /// Withdraw a publisher
    pub async fn terminate_publisher(&self, id: i32, name: &str) -> Result<()> {
        self.requests
            .request_checked(
                &RegistryRequest::TerminatePublisher {
                    id,
                    name: name.to_string(),
                },
                name,
            )
            .await?;
        Ok(())
    }

    /// Declare that the instance handles stop requests itself
    pub async fn set_stop_handler(&self, id: i32, stopping_time: i32) -> Result<()> {
        self.requests
            .request_checked(
                &RegistryRequest::SetStopHandler { id, stopping_time },
                &id.to_string(),
            )
            .await?;
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        tracing::debug!(endpoint = %self.config.endpoint, "Registry connection closed");
    }
}
