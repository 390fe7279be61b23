//! Application registry
//!
//! Server-side state of the embedded registry: attached applications, their
//! lifecycle, key-value stores, publishers and leased ports.
//!
//! # Architecture
//!
//! ```text
//!                    ApplicationRegistry
//!               ┌──────────────────────────┐
//!               │ apps: HashMap<id,        │
//!               │   AppEntry {             │
//!               │     state, past_states,  │
//!               │     keys, publishers,    │
//!               │   }                      │
//!               │ >                        │
//!               │ ports: PortPool          │
//!               └────────────┬─────────────┘
//!                            │ Vec<Event>
//!                            ▼
//!                RegistryServer push stream ──► client dispatchers
//! ```
//!
//! Mutations return the events they caused instead of publishing them, so
//! the store has no knowledge of sockets.

pub mod entry;
pub mod error;
pub mod ports;
pub mod store;

pub use entry::AppEntry;
pub use error::RegistryError;
pub use ports::PortPool;
pub use store::ApplicationRegistry;
