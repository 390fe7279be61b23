//! Registry events
//!
//! - `model`: the [`Event`] enum and push stream frame decoding
//! - `queue`: per-consumer FIFO with blocking pop
//! - `listener`: name-filtered consumer owning one queue
//! - `dispatch`: task fanning the push stream out to listeners

pub mod dispatch;
pub mod listener;
pub mod model;
pub mod queue;

pub use dispatch::{EventDispatcher, ListenerRegistration};
pub use listener::EventListener;
pub use model::{
    CancelEvent, Event, KeyEvent, KeyOperation, PortEvent, PublisherEvent, ResultEvent,
    StatusEvent,
};
pub use queue::EventQueue;
