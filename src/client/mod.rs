//! Registry client
//!
//! - `Server`: connection to a registry (RPC + event dispatcher)
//! - `Instance`: lifecycle tracking of one application
//! - `KeyValueGetter`: waiting read used for discovery
//! - `This`: registration of the current process

pub mod config;
pub mod instance;
pub mod key_value;
pub mod request_socket;
pub mod server;
pub mod this;

pub use config::ClientConfig;
pub use instance::{Instance, WaitFilter, WaitOutcome};
pub use key_value::KeyValueGetter;
pub use request_socket::RequestSocket;
pub use server::Server;
pub use this::This;
