//! Client configuration

use std::time::Duration;

use crate::protocol::constants::DEFAULT_MAX_PART_SIZE;
use crate::protocol::Endpoint;

/// Registry connection and data-plane options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Registry request endpoint
    pub endpoint: Endpoint,

    /// Timeout of one registry round trip
    pub request_timeout: Duration,

    /// First timeout of the requester synchronization, grows on every retry
    pub sync_interval: Duration,

    /// Total time a requester or subscriber may spend synchronizing
    pub discovery_timeout: Duration,

    /// Maximum size of one frame part
    pub max_part_size: usize,

    /// Messages a slow subscriber may lag behind before losing data
    pub publisher_capacity: usize,

    /// Host data sockets bind to
    pub bind_host: String,

    /// Reach responders through the registry proxy instead of their own port
    pub use_proxy: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("localhost", 7000),
            request_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_millis(200),
            discovery_timeout: Duration::from_secs(10),
            max_part_size: DEFAULT_MAX_PART_SIZE,
            publisher_capacity: 4096,
            bind_host: "0.0.0.0".to_string(),
            use_proxy: false,
        }
    }
}

impl ClientConfig {
    /// Create a config for a registry endpoint
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    /// Set the registry round trip timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the first requester synchronization timeout
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the total synchronization budget
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the maximum frame part size
    pub fn max_part_size(mut self, size: usize) -> Self {
        self.max_part_size = size;
        self
    }

    /// Set the publisher backlog per subscriber
    pub fn publisher_capacity(mut self, capacity: usize) -> Self {
        self.publisher_capacity = capacity.max(1);
        self
    }

    /// Set the host data sockets bind to
    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Send requests through the registry proxy
    ///
    /// Subscribers always connect to publishers directly.
    pub fn use_proxy(mut self, enabled: bool) -> Self {
        self.use_proxy = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();

        assert_eq!(config.endpoint.port, 7000);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.sync_interval, Duration::from_millis(200));
        assert_eq!(config.max_part_size, DEFAULT_MAX_PART_SIZE);
        assert_eq!(config.bind_host, "0.0.0.0");
        assert!(!config.use_proxy);
    }

    #[test]
    fn test_new_keeps_defaults() {
        let config = ClientConfig::new(Endpoint::new("gamma", 9000));

        assert_eq!(config.endpoint.to_string(), "tcp://gamma:9000");
        assert_eq!(config.discovery_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_builder_publisher_capacity_not_zero() {
        let config = ClientConfig::default().publisher_capacity(0);

        assert_eq!(config.publisher_capacity, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let config = ClientConfig::default()
            .request_timeout(Duration::from_secs(1))
            .sync_interval(Duration::from_millis(50))
            .discovery_timeout(Duration::from_secs(3))
            .max_part_size(1024)
            .bind_host("127.0.0.1")
            .use_proxy(true);

        assert_eq!(config.request_timeout, Duration::from_secs(1));
        assert_eq!(config.sync_interval, Duration::from_millis(50));
        assert_eq!(config.discovery_timeout, Duration::from_secs(3));
        assert_eq!(config.max_part_size, 1024);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert!(config.use_proxy);
    }
}
