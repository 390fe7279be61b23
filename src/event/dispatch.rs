//! Event dispatcher
//!
//! One task per registry connection reads the push stream, decodes every
//! frame and pushes a copy of the event into each interested listener.
//!
//! ```text
//!   registry PUB ──► SubSocket ──► decode_frame ──► listeners (snapshot)
//!                        ▲                              │
//!                   cancel()                        push_event
//! ```

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::protocol::constants::TAG_CANCEL;
use crate::protocol::Endpoint;
use crate::transport::{ControlHandle, SubSocket};

use super::listener::EventListener;
use super::model::{decode_frame, Event, Frame};

#[derive(Default)]
struct ListenerState {
    listeners: Vec<Arc<EventListener>>,
    closed: bool,
}

/// Listeners registered on one dispatcher
#[derive(Default)]
struct ListenerList {
    state: Mutex<ListenerState>,
}

impl ListenerList {
    fn add(&self, listener: &Arc<EventListener>) {
        let Ok(mut state) = self.state.lock() else {
            listener.close();
            return;
        };

        if state.closed {
            listener.close();
        } else {
            state.listeners.push(listener.clone());
        }
    }

    fn remove(&self, listener: &Arc<EventListener>) {
        if let Ok(mut state) = self.state.lock() {
            state.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    fn dispatch(&self, event: Event) {
        let snapshot = match self.state.lock() {
            Ok(state) => state.listeners.clone(),
            Err(_) => return,
        };

        for listener in snapshot.iter().filter(|l| l.accepts(&event)) {
            listener.push_event(event.clone());
        }
    }

    fn close(&self) {
        let snapshot = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                std::mem::take(&mut state.listeners)
            }
            Err(_) => return,
        };

        for listener in snapshot {
            listener.close();
        }
    }
}

/// Registration of a listener, removed when dropped
pub struct ListenerRegistration {
    list: Arc<ListenerList>,
    listener: Arc<EventListener>,
}

impl ListenerRegistration {
    /// The registered listener
    pub fn listener(&self) -> &Arc<EventListener> {
        &self.listener
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.list.remove(&self.listener);
    }
}

/// Decodes the registry push stream and fans events out to listeners
pub struct EventDispatcher {
    listeners: Arc<ListenerList>,
    control: ControlHandle,
    task: JoinHandle<()>,
}

impl EventDispatcher {
    /// Connect to the push endpoint and start dispatching
    pub async fn connect(endpoint: &Endpoint, max_part_size: usize) -> Result<Self> {
        let socket = SubSocket::connect(endpoint, max_part_size).await?;
        socket.subscribe(Bytes::new());

        let listeners = Arc::new(ListenerList::default());
        let control = socket.control();
        let task = tokio::spawn(run(socket, listeners.clone()));

        tracing::debug!(endpoint = %endpoint, "Event dispatcher started");

        Ok(Self {
            listeners,
            control,
            task,
        })
    }

    /// Register a listener
    ///
    /// When the stream has already ended the listener is closed right away.
    pub fn register(&self, listener: Arc<EventListener>) -> ListenerRegistration {
        self.listeners.add(&listener);
        ListenerRegistration {
            list: self.listeners.clone(),
            listener,
        }
    }

    /// Stop dispatching, every listener is then closed
    pub fn cancel(&self) {
        self.control.send(vec![Bytes::from_static(TAG_CANCEL.as_bytes())]);
    }

    /// Check if the dispatch task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run(socket: SubSocket, listeners: Arc<ListenerList>) {
    loop {
        let Some(envelope) = socket.recv().await else {
            tracing::debug!("Event stream closed");
            break;
        };

        match decode_frame(&envelope.parts) {
            Ok(Frame::Event(event)) => listeners.dispatch(event),
            Ok(Frame::Cancel) => {
                tracing::debug!(local = envelope.is_local(), "Event stream canceled");
                break;
            }
            Ok(Frame::Unknown(tag)) => {
                tracing::warn!(tag = %tag, "Ignoring event with unknown tag");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping undecodable event frame");
            }
        }
    }

    listeners.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::model::PortEvent;
    use crate::transport::PubSocket;
    use std::time::Duration;

    fn port_event(id: i32, name: &str) -> Event {
        Event::Port(PortEvent {
            id,
            name: name.into(),
            port_name: "p".into(),
        })
    }

    async fn setup() -> (PubSocket, EventDispatcher) {
        let publisher = PubSocket::bind("127.0.0.1:0", 64, 1024).await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", publisher.local_addr().port());
        let dispatcher = EventDispatcher::connect(&endpoint, 1024).await.unwrap();
        (publisher, dispatcher)
    }

    async fn pop(listener: &EventListener) -> Option<Event> {
        listener.pop_event(true, Some(Duration::from_secs(2))).await
    }

    #[tokio::test]
    async fn test_fan_out_by_name() {
        let (publisher, dispatcher) = setup().await;

        let all = Arc::new(EventListener::unfiltered());
        let a = Arc::new(EventListener::new("A"));
        let b = Arc::new(EventListener::new("B"));
        let _r1 = dispatcher.register(all.clone());
        let _r2 = dispatcher.register(a.clone());
        let _r3 = dispatcher.register(b.clone());

        publisher.send(&port_event(1, "A").encode().unwrap()).unwrap();
        publisher.send(&port_event(2, "B").encode().unwrap()).unwrap();

        assert_eq!(pop(&all).await, Some(port_event(1, "A")));
        assert_eq!(pop(&all).await, Some(port_event(2, "B")));
        assert_eq!(pop(&a).await, Some(port_event(1, "A")));
        assert_eq!(pop(&b).await, Some(port_event(2, "B")));

        assert!(a.pop_event(false, None).await.is_none());
        assert!(b.pop_event(false, None).await.is_none());
    }

    #[tokio::test]
    async fn test_bad_frames_are_skipped() {
        let (publisher, dispatcher) = setup().await;
        let listener = Arc::new(EventListener::unfiltered());
        let _registration = dispatcher.register(listener.clone());

        publisher.send(&[Bytes::from_static(b"PORT"), Bytes::from_static(b"{oops")]).unwrap();
        publisher.send(&[Bytes::from_static(b"NEWTAG"), Bytes::from_static(b"{}")]).unwrap();
        publisher.send(&port_event(3, "C").encode().unwrap()).unwrap();

        assert_eq!(pop(&listener).await, Some(port_event(3, "C")));
    }

    #[tokio::test]
    async fn test_cancel_closes_listeners() {
        let (_publisher, dispatcher) = setup().await;
        let listener = Arc::new(EventListener::new("A"));
        let _registration = dispatcher.register(listener.clone());

        dispatcher.cancel();

        assert!(listener.pop_event(true, None).await.is_none());
        assert!(listener.is_closed());

        let late = Arc::new(EventListener::new("A"));
        let _late = dispatcher.register(late.clone());
        assert!(late.is_closed());
    }

    #[tokio::test]
    async fn test_remote_cancel_frame_ends_stream() {
        let (publisher, dispatcher) = setup().await;
        let listener = Arc::new(EventListener::unfiltered());
        let _registration = dispatcher.register(listener.clone());

        publisher.send(&port_event(1, "A").encode().unwrap()).unwrap();
        publisher.send(&Event::cancel(0).encode().unwrap()).unwrap();

        assert_eq!(pop(&listener).await, Some(port_event(1, "A")));
        assert!(listener.pop_event(true, None).await.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_listener_stops_receiving() {
        let (publisher, dispatcher) = setup().await;
        let kept = Arc::new(EventListener::unfiltered());
        let dropped = Arc::new(EventListener::unfiltered());
        let _kept = dispatcher.register(kept.clone());
        let registration = dispatcher.register(dropped.clone());

        drop(registration);
        publisher.send(&port_event(1, "A").encode().unwrap()).unwrap();

        assert_eq!(pop(&kept).await, Some(port_event(1, "A")));
        assert!(dropped.pop_event(false, None).await.is_none());
    }
}
