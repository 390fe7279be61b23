//! Embedded registry server
//!
//! A registry for tests and single-host deployments: it tracks applications
//! that attach themselves (no process launching) and serves the request and
//! push endpoints the client side connects to.

pub mod config;
pub mod handler;
pub mod listener;
pub mod proxy;

pub use config::ServerConfig;
pub use handler::{Handled, ServerPorts};
pub use listener::RegistryServer;
pub use proxy::ResponderProxy;
