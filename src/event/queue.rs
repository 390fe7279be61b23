//! Event queue
//!
//! Unbounded FIFO with a blocking pop. Waiting consumers are parked on a
//! [`Notify`] and woken by every push and by `close`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use super::model::Event;

#[derive(Default)]
struct QueueInner {
    events: VecDeque<Event>,
    closed: bool,
}

/// Per-consumer queue of events
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    ///
    /// Events pushed after `close` are still delivered before end-of-stream.
    pub fn push(&self, event: Event) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.events.push_back(event);
        }
        self.notify.notify_waiters();
    }

    /// Mark the end of the stream
    ///
    /// Queued events remain poppable; once drained, pops return `None`.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Check if `close` was called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|inner| inner.closed).unwrap_or(true)
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.events.len()).unwrap_or(0)
    }

    /// Check if no event is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop without waiting
    pub fn poll(&self) -> Option<Event> {
        self.inner.lock().ok()?.events.pop_front()
    }

    /// Pop, waiting for an event
    ///
    /// Returns `None` when the queue is closed and drained.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so that a push in between is not missed.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().ok()?;
                if let Some(event) = inner.events.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Pop, waiting at most `timeout`
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.pop()).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = EventQueue::new();
        for id in 0..5 {
            queue.push(Event::cancel(id));
        }

        for id in 0..5 {
            assert_eq!(queue.pop().await.map(|e| e.id()), Some(id));
        }
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_pending_pop_woken_by_push() {
        let queue = EventQueue::new();
        let mut pop = tokio_test::task::spawn(queue.pop());

        tokio_test::assert_pending!(pop.poll());
        queue.push(Event::cancel(4));
        assert!(pop.is_woken());
        tokio_test::assert_ready_eq!(pop.poll(), Some(Event::cancel(4)));
    }

    #[tokio::test]
    async fn test_pop_timeout_expires() {
        let queue = EventQueue::new();
        let start = std::time::Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(50)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_blocked_pop_observes_push_from_other_task() {
        let queue = Arc::new(EventQueue::new());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(Event::cancel(9));

        let event = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, Some(Event::cancel(9)));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = Arc::new(EventQueue::new());
        queue.push(Event::cancel(1));
        queue.close();
        assert!(queue.is_closed());

        assert_eq!(queue.pop().await.map(|e| e.id()), Some(1));
        assert!(queue.pop().await.is_none());

        let waiting = EventQueue::new();
        let waiting = Arc::new(waiting);
        let consumer = {
            let waiting = waiting.clone();
            tokio::spawn(async move { waiting.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiting.close();
        assert!(consumer.await.unwrap().is_none());
    }
}
