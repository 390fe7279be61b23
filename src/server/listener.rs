//! Registry server listener
//!
//! Serves the request endpoint, the push endpoint and the responder proxy.
//! Requests are handled one at a time in arrival order, so the events of a
//! request are always published before the response is sent and before the
//! next request is handled.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::event::Event;
use crate::protocol::constants::VALUE_ERROR;
use crate::protocol::message::json_part;
use crate::protocol::{Endpoint, Response};
use crate::registry::{ApplicationRegistry, PortPool};
use crate::server::config::ServerConfig;
use crate::server::handler::{handle_frame, Handled, ServerPorts};
use crate::server::proxy::ResponderProxy;
use crate::transport::{Envelope, PubSocket, RouterSocket};

/// Embedded registry server
pub struct RegistryServer {
    config: ServerConfig,
    registry: Arc<ApplicationRegistry>,
    requests: RouterSocket,
    events: PubSocket,
    proxy: ResponderProxy,
    stopped: AtomicBool,
}

impl RegistryServer {
    /// Bind both endpoints
    ///
    /// The push endpoint binds an ephemeral port on the same host; clients
    /// discover it with an `event_port` request.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let requests = RouterSocket::bind(config.bind_addr, config.max_part_size).await?;
        let events = PubSocket::bind(
            SocketAddr::new(config.bind_addr.ip(), 0),
            config.event_capacity,
            config.max_part_size,
        )
        .await?;

        let registry = Arc::new(ApplicationRegistry::new(PortPool::new(
            config.port_range_start,
            config.port_range_len,
        )));

        let proxy = ResponderProxy::bind(
            SocketAddr::new(config.bind_addr.ip(), config.responder_proxy_port),
            registry.clone(),
            config.max_part_size,
        )
        .await?;

        tracing::info!(
            addr = %requests.local_addr(),
            event_port = events.local_addr().port(),
            responder_proxy_port = proxy.local_addr().port(),
            "Registry server listening"
        );

        Ok(Self {
            config,
            registry,
            requests,
            events,
            proxy,
            stopped: AtomicBool::new(false),
        })
    }

    /// Get a reference to the application registry
    pub fn registry(&self) -> &Arc<ApplicationRegistry> {
        &self.registry
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address of the request endpoint
    pub fn local_addr(&self) -> SocketAddr {
        self.requests.local_addr()
    }

    /// Address of the push endpoint
    pub fn event_addr(&self) -> SocketAddr {
        self.events.local_addr()
    }

    /// Address of the responder proxy
    pub fn responder_proxy_addr(&self) -> SocketAddr {
        self.proxy.local_addr()
    }

    /// Endpoint clients connect to
    ///
    /// An unspecified bind address is reported as `localhost`.
    pub fn endpoint(&self) -> Endpoint {
        let addr = self.local_addr();
        if addr.ip().is_unspecified() {
            Endpoint::new("localhost", addr.port())
        } else {
            Endpoint::new(addr.ip().to_string(), addr.port())
        }
    }

    /// Run the server
    ///
    /// This method runs until the task is aborted.
    pub async fn run(&self) -> Result<()> {
        self.serve().await;
        self.shutdown();
        Ok(())
    }

    /// Run the server with graceful shutdown
    ///
    /// Clients are sent a `CANCEL` frame once `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
            }
            _ = self.serve() => {}
        }

        self.shutdown();
        Ok(())
    }

    async fn serve(&self) {
        let ports = ServerPorts {
            event: self.event_addr().port(),
            responder_proxy: self.responder_proxy_addr().port(),
        };

        let requests = async {
            while let Some(envelope) = self.requests.recv().await {
                self.handle_envelope(envelope, ports).await;
            }
        };

        tokio::select! {
            _ = requests => {}
            _ = self.proxy.run() => {}
        }
    }

    async fn handle_envelope(&self, envelope: Envelope, ports: ServerPorts) {
        let outcome = tokio::time::timeout(
            self.config.request_timeout,
            handle_frame(&self.registry, &envelope.parts, ports),
        )
        .await;

        let Handled { response, events } = match outcome {
            Ok(handled) => handled,
            Err(_) => {
                tracing::warn!(peer = %envelope.peer, "Registry request timed out");
                Handled {
                    response: Response::error(VALUE_ERROR, "Request timed out"),
                    events: Vec::new(),
                }
            }
        };

        for event in &events {
            self.publish(event);
        }

        match json_part(&response) {
            Ok(part) => match self.requests.send_to(envelope.peer, &[part]) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(peer = %envelope.peer, "Requester gone before response");
                }
                Err(e) => {
                    tracing::warn!(peer = %envelope.peer, error = %e, "Failed to send response");
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode response");
            }
        }
    }

    /// Publish an event on the push stream
    pub fn publish(&self, event: &Event) {
        match event.encode() {
            Ok(parts) => match self.events.send(&parts) {
                Ok(receivers) => {
                    tracing::trace!(id = event.id(), receivers = receivers, "Event published");
                }
                Err(e) => {
                    tracing::warn!(id = event.id(), error = %e, "Failed to publish event");
                }
            },
            Err(e) => {
                tracing::warn!(id = event.id(), error = %e, "Failed to encode event");
            }
        }
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.publish(&Event::cancel(0));
        tracing::info!(addr = %self.local_addr(), "Registry server stopped");
    }
}

impl Drop for RegistryServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
