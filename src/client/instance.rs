//! Application instance
//!
//! An [`Instance`] is a handle on one application known to the registry. It
//! owns a listener receiving the events of its application and tracks the
//! lifecycle from them:
//!
//! ```text
//!            ┌──────────── pop event ◄───────────┐
//!            ▼                                   │
//!   Status(id) ──► past |= , last = state ──► terminal or past in mask? ──► return
//!   Result(id) ──► stored                        │ no
//!   Key/Port/Publisher matching filter ──► return with the event
//!   Cancel(id) or end-of-stream ──► return last state
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::error::Result;
use crate::event::{Event, EventListener, KeyEvent, ListenerRegistration, PortEvent, PublisherEvent};
use crate::protocol::message::ApplicationInfo;
use crate::protocol::Endpoint;
use crate::state::{State, StateMask};

use super::server::Server;

/// Event that ends a wait besides lifecycle changes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WaitFilter {
    /// Lifecycle changes only
    #[default]
    None,
    /// Key stored or removed
    Key(String),
    /// Named port requested
    Port(String),
    /// Publisher announced
    Publisher(String),
}

impl WaitFilter {
    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (WaitFilter::Key(key), Event::KeyValue(e)) => e.key == *key,
            (WaitFilter::Port(name), Event::Port(e)) => e.port_name == *name,
            (WaitFilter::Publisher(name), Event::PublisherReady(e)) => e.publisher_name == *name,
            _ => false,
        }
    }
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    /// Last known state of the instance
    pub state: State,
    /// Event that matched the wait filter, if that ended the wait
    pub matched: Option<Event>,
}

#[derive(Debug, Clone)]
struct InstanceState {
    last_state: State,
    past_states: StateMask,
    exit_code: Option<i32>,
    result: Option<Bytes>,
}

/// Handle on an application instance
pub struct Instance {
    server: Arc<Server>,
    id: i32,
    name: String,
    listener: Arc<EventListener>,
    _registration: ListenerRegistration,
    state: Mutex<InstanceState>,
    canceled: AtomicBool,
}

impl Instance {
    /// Create an instance from a registry description and bring its state
    /// up to date
    ///
    /// The listener is registered before the status is read again, so that
    /// no transition between the two can be missed.
    pub(crate) async fn attach(server: Arc<Server>, info: &ApplicationInfo) -> Self {
        let initial = InstanceState {
            last_state: State::from_bits(info.application_state),
            past_states: StateMask::from_bits(info.past_application_states),
            exit_code: None,
            result: None,
        };

        let instance = Self::with_state(server, info.id, info.name.clone(), initial);
        instance.refresh().await;
        instance
    }

    fn with_state(server: Arc<Server>, id: i32, name: String, state: InstanceState) -> Self {
        let listener = Arc::new(EventListener::new(name.clone()));
        let registration = server.register_listener(listener.clone());

        Self {
            server,
            id,
            name,
            listener,
            _registration: registration,
            state: Mutex::new(state),
            canceled: AtomicBool::new(false),
        }
    }

    /// Another handle on the same instance with its own listener
    ///
    /// The copy starts from the current known state and only sees the
    /// events published after its creation.
    pub fn duplicate(&self) -> Self {
        let state = self.lock_state().clone();
        Self::with_state(self.server.clone(), self.id, self.name.clone(), state)
    }

    /// Merge the status known by the registry into the local state
    pub async fn refresh(&self) {
        match self.server.status(self.id).await {
            Ok(status) => {
                let mut state = self.lock_state();
                state.past_states |= StateMask::from_bits(status.past_application_states);
                state.last_state = State::from_bits(status.application_state);
                if status.exit_code.is_some() {
                    state.exit_code = status.exit_code;
                }
            }
            Err(e) => {
                tracing::debug!(app = %self.name, id = self.id, error = %e, "Status refresh failed");
            }
        }
    }

    /// Application id
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Application name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint of the registry the instance belongs to
    pub fn endpoint(&self) -> &Endpoint {
        self.server.endpoint()
    }

    /// Registry connection
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Check if the instance was known to the registry when created
    pub fn exists(&self) -> bool {
        self.id > 0
    }

    /// Every state observed so far
    pub fn past_states(&self) -> StateMask {
        self.lock_state().past_states
    }

    /// Exit code, once the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        self.lock_state().exit_code
    }

    /// Check if a wait was ended by a cancel
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Check if the event stream of this instance has ended
    pub fn is_closed(&self) -> bool {
        self.listener.is_closed()
    }

    /// Wait for a set of states, a filtered event, or a terminal state
    ///
    /// `handler` is called with every state change observed. Without
    /// `blocking`, only the already queued events are consumed.
    pub async fn wait_for_with(
        &self,
        states: StateMask,
        filter: &WaitFilter,
        handler: Option<&(dyn Fn(State) + Send + Sync)>,
        blocking: bool,
    ) -> WaitOutcome {
        {
            let state = self.lock_state();
            if !self.exists()
                || state.last_state.is_terminal()
                || states.intersects(state.past_states)
            {
                return WaitOutcome {
                    state: state.last_state,
                    matched: None,
                };
            }
        }

        let listener = self.listener.clone();
        let id = self.id;
        let _waiting = self.server.waiting().add(move || listener.cancel(id));

        loop {
            let Some(event) = self.listener.pop_event(blocking, None).await else {
                return self.outcome(None);
            };

            if event.id() != self.id {
                continue;
            }

            match &event {
                Event::Cancel(_) => {
                    self.canceled.store(true, Ordering::Release);
                    return self.outcome(None);
                }
                Event::Status(status) => {
                    // A missed transition still shows up in the merged past states.
                    let reached = {
                        let mut state = self.lock_state();
                        state.past_states |= status.past_states;
                        state.past_states.insert(status.state);
                        state.last_state = status.state;
                        if status.exit_code.is_some() {
                            state.exit_code = status.exit_code;
                        }
                        states.intersects(state.past_states)
                    };

                    tracing::trace!(app = %self.name, id = self.id, state = %status.state, "State changed");

                    if let Some(handler) = handler {
                        handler(status.state);
                    }

                    if status.state.is_terminal() || reached {
                        return self.outcome(None);
                    }
                }
                Event::Result(result) => {
                    self.lock_state().result = Some(result.data.clone());
                }
                _ => {
                    if filter.matches(&event) {
                        return self.outcome(Some(event));
                    }
                }
            }
        }
    }

    /// Wait for a terminal state
    pub async fn wait_for(&self) -> State {
        self.wait_for_states(StateMask::EMPTY).await
    }

    /// Wait for one of `states` or a terminal state
    pub async fn wait_for_states(&self, states: StateMask) -> State {
        self.wait_for_with(states, &WaitFilter::None, None, true)
            .await
            .state
    }

    /// Wait for a change of `key`
    ///
    /// Returns `None` when the instance terminated or the wait was canceled.
    pub async fn wait_for_key(&self, key: &str) -> Option<KeyEvent> {
        let outcome = self
            .wait_for_with(StateMask::EMPTY, &WaitFilter::Key(key.to_string()), None, true)
            .await;
        match outcome.matched {
            Some(Event::KeyValue(event)) => Some(event),
            _ => None,
        }
    }

    /// Wait for the port `name` to be requested
    pub async fn wait_for_port(&self, name: &str) -> Option<PortEvent> {
        let outcome = self
            .wait_for_with(StateMask::EMPTY, &WaitFilter::Port(name.to_string()), None, true)
            .await;
        match outcome.matched {
            Some(Event::Port(event)) => Some(event),
            _ => None,
        }
    }

    /// Wait for the publisher `name` to be announced
    pub async fn wait_for_publisher(&self, name: &str) -> Option<PublisherEvent> {
        let outcome = self
            .wait_for_with(StateMask::EMPTY, &WaitFilter::Publisher(name.to_string()), None, true)
            .await;
        match outcome.matched {
            Some(Event::PublisherReady(event)) => Some(event),
            _ => None,
        }
    }

    /// Consume the queued events and return the last known state
    pub async fn last_state(&self) -> State {
        self.wait_for_with(StateMask::EMPTY, &WaitFilter::None, None, false)
            .await
            .state
    }

    /// Current state as known by the registry
    pub async fn now(&self) -> Result<State> {
        self.server.actual_state(self.id).await
    }

    /// Wait for a terminal state and return the published result
    pub async fn result(&self) -> Option<Bytes> {
        self.wait_for().await;
        self.lock_state().result.clone()
    }

    /// Unblock a wait running in another task
    pub fn cancel(&self) {
        self.listener.cancel(self.id);
    }

    /// Request a graceful stop
    pub async fn stop(&self) -> Result<()> {
        self.server.stop(self.id).await
    }

    /// Kill the instance
    pub async fn kill(&self) -> Result<()> {
        self.server.kill(self.id).await
    }

    fn outcome(&self, matched: Option<Event>) -> WaitOutcome {
        WaitOutcome {
            state: self.lock_state().last_state,
            matched,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        // Only plain field updates happen under the lock, a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.name, self.id, self.server.endpoint())
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &*self.lock_state())
            .finish()
    }
}
