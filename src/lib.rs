//! cameo-rs: coordination middleware for cooperating applications
//!
//! Applications register with a registry, observe each other's lifecycle
//! through a push stream of events, and talk to each other through
//! request/reply and publish/subscribe patterns discovered via the
//! key-value store of the serving application.
//!
//! # Layers
//!
//! ```text
//!   coms       Responder / ResponderRouter / Requester / Publisher / Subscriber
//!     │
//!   client     This, Server, Instance, KeyValueGetter
//!     │
//!   event      EventDispatcher ──► EventListener ──► EventQueue
//!     │
//!   transport  PubSocket / SubSocket / RouterSocket / DealerSocket
//! ```
//!
//! `registry` and `server` implement an embedded registry, used by the tests
//! and demos.
//!
//! # Example
//!
//! ```no_run
//! use cameo_rs::client::{ClientConfig, This};
//! use cameo_rs::coms::basic::Responder;
//! use cameo_rs::protocol::Endpoint;
//!
//! # async fn run() -> cameo_rs::Result<()> {
//! let config = ClientConfig::new(Endpoint::parse("tcp://localhost:7000")?);
//! let this = This::init(config, "echo").await?;
//!
//! let responder = Responder::create(&this, "echo").await?;
//! while let Some(request) = responder.receive().await {
//!     request.reply(request.get().clone())?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod coms;
pub mod error;
pub mod event;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;
pub mod transport;
pub mod waiting;

pub use client::{ClientConfig, Instance, Server, This};
pub use error::{Error, Result};
pub use event::Event;
pub use server::{RegistryServer, ServerConfig};
pub use state::{State, StateMask};
