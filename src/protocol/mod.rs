//! Wire protocol
//!
//! - `constants`: push stream tags, discovery namespaces, response values
//! - `endpoint`: `tcp://host:port` addressing
//! - `message`: JSON bodies of registry requests, push events and
//!   data-plane messages

pub mod constants;
pub mod endpoint;
pub mod message;

pub use endpoint::Endpoint;
pub use message::{ComsMessage, RegistryRequest, Response};
