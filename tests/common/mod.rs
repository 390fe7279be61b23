//! Shared setup of the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cameo_rs::client::{ClientConfig, Instance, This};
use cameo_rs::server::{RegistryServer, ServerConfig};
use tokio::task::JoinHandle;

/// Embedded registry running on a loopback port
pub struct Registry {
    pub server: Arc<RegistryServer>,
    task: JoinHandle<()>,
}

impl Registry {
    /// Start a registry leasing ports from `port_start..port_start + 50`
    pub async fn start(port_start: u16) -> Self {
        let config = ServerConfig::with_addr("127.0.0.1:0".parse().unwrap())
            .port_range(port_start, 50)
            .request_timeout(Duration::from_secs(2));
        let server = Arc::new(RegistryServer::bind(config).await.unwrap());

        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.run().await;
            })
        };

        Self { server, task }
    }

    /// Client configuration pointing at this registry
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.server.endpoint())
            .bind_host("127.0.0.1")
            .request_timeout(Duration::from_secs(2))
            .sync_interval(Duration::from_millis(50))
            .discovery_timeout(Duration::from_secs(3))
    }

    /// Attach a new application
    pub async fn attach(&self, name: &str) -> Arc<This> {
        This::init(self.client_config(), name).await.unwrap()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Handle on `app` as seen from `observer`
pub async fn instance_of(observer: &This, app: &This) -> Instance {
    observer.server().connect_with_id(app.id()).await.unwrap()
}

/// Upper bound of every wait in the tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
