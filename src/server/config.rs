//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::constants::DEFAULT_MAX_PART_SIZE;

/// Default request port of the registry
pub const DEFAULT_REGISTRY_PORT: u16 = 7000;

/// Registry server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the request endpoint, the push endpoint binds the same host
    pub bind_addr: SocketAddr,

    /// First port leased to applications
    pub port_range_start: u16,

    /// Number of ports leased to applications
    pub port_range_len: u16,

    /// Maximum time spent handling one request
    pub request_timeout: Duration,

    /// Maximum size of one frame part
    pub max_part_size: usize,

    /// Events a slow client may lag behind before losing some
    pub event_capacity: usize,

    /// Port of the responder proxy, 0 for an ephemeral one
    pub responder_proxy_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_REGISTRY_PORT)),
            port_range_start: 7001,
            port_range_len: 1000,
            request_timeout: Duration::from_secs(5),
            max_part_size: DEFAULT_MAX_PART_SIZE,
            event_capacity: 1024,
            responder_proxy_port: 0,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the range of ports leased to applications
    pub fn port_range(mut self, start: u16, len: u16) -> Self {
        self.port_range_start = start;
        self.port_range_len = len.min(u16::MAX - start);
        self
    }

    /// Set the request handling timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum frame part size
    pub fn max_part_size(mut self, size: usize) -> Self {
        self.max_part_size = size;
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Set the responder proxy port
    pub fn responder_proxy_port(mut self, port: u16) -> Self {
        self.responder_proxy_port = port;
        self
    }
}
