//! Event listener

use std::sync::Mutex;
use std::time::Duration;

use super::model::Event;
use super::queue::EventQueue;

/// Consumer of the events of one application (or of all of them)
///
/// The dispatcher pushes every event whose application name equals the
/// listener name; a listener with an empty name receives everything.
#[derive(Default)]
pub struct EventListener {
    name: Mutex<String>,
    queue: EventQueue,
}

impl EventListener {
    /// Create a listener for the events of `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Mutex::new(name.into()),
            queue: EventQueue::new(),
        }
    }

    /// Create a listener receiving every event
    pub fn unfiltered() -> Self {
        Self::default()
    }

    /// Change the application name filter
    pub fn set_name(&self, name: impl Into<String>) {
        if let Ok(mut current) = self.name.lock() {
            *current = name.into();
        }
    }

    /// Current application name filter
    pub fn name(&self) -> String {
        self.name.lock().map(|name| name.clone()).unwrap_or_default()
    }

    /// Check if the listener wants the event
    pub fn accepts(&self, event: &Event) -> bool {
        match self.name.lock() {
            Ok(name) => name.is_empty() || *name == event.name(),
            Err(_) => false,
        }
    }

    /// Queue an event
    pub fn push_event(&self, event: Event) {
        self.queue.push(event);
    }

    /// Next event
    ///
    /// Without `blocking` only an already queued event is returned. With
    /// `blocking` the call waits for an event, at most `timeout` if given.
    /// Returns `None` when nothing arrived or the stream has ended.
    pub async fn pop_event(&self, blocking: bool, timeout: Option<Duration>) -> Option<Event> {
        if !blocking {
            return self.queue.poll();
        }

        match timeout {
            Some(timeout) => self.queue.pop_timeout(timeout).await,
            None => self.queue.pop().await,
        }
    }

    /// Unblock a waiter by queuing a cancel event for `id`
    pub fn cancel(&self, id: i32) {
        tracing::trace!(id = id, "Cancel event queued");
        self.queue.push(Event::cancel(id));
    }

    /// End the stream, waiters get `None` once the queue is drained
    pub fn close(&self) {
        self.queue.close();
    }

    /// Check if the stream has ended
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::model::PortEvent;

    fn port_event(name: &str) -> Event {
        Event::Port(PortEvent {
            id: 1,
            name: name.into(),
            port_name: "p".into(),
        })
    }

    #[test]
    fn test_name_filter() {
        let unfiltered = EventListener::unfiltered();
        let listener = EventListener::new("a");

        assert!(unfiltered.accepts(&port_event("a")));
        assert!(unfiltered.accepts(&port_event("b")));
        assert!(listener.accepts(&port_event("a")));
        assert!(!listener.accepts(&port_event("b")));

        listener.set_name("b");
        assert_eq!(listener.name(), "b");
        assert!(listener.accepts(&port_event("b")));
    }

    #[tokio::test]
    async fn test_non_blocking_pop() {
        let listener = EventListener::new("a");
        assert!(listener.pop_event(false, None).await.is_none());

        listener.push_event(port_event("a"));
        assert_eq!(listener.pop_event(false, None).await, Some(port_event("a")));
    }

    #[tokio::test]
    async fn test_cancel_is_queued_after_pending_events() {
        let listener = EventListener::new("a");
        listener.push_event(port_event("a"));
        listener.cancel(7);

        assert_eq!(listener.pop_event(true, None).await, Some(port_event("a")));
        assert_eq!(listener.pop_event(true, None).await, Some(Event::cancel(7)));
        assert!(listener
            .pop_event(true, Some(Duration::from_millis(10)))
            .await
            .is_none());
    }
}
