//! Application entry types
//!
//! This module defines the per-application state stored in the registry.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;

use crate::event::{Event, StatusEvent};
use crate::protocol::message::{ApplicationInfo, StatusBody};
use crate::state::{State, StateMask};

/// Entry for a single application instance in the registry
#[derive(Debug)]
pub struct AppEntry {
    /// Registry-assigned id
    pub id: i32,

    /// Application name
    pub name: String,

    /// Process id reported on attach
    pub pid: Option<u32>,

    /// Current state
    pub state: State,

    /// Every state the application has been in
    pub past_states: StateMask,

    /// Exit code, once terminated
    pub exit_code: Option<i32>,

    /// Last published result
    pub result: Option<Bytes>,

    /// Key-value store
    pub keys: HashMap<String, String>,

    /// Announced publishers and their expected subscriber count
    pub publishers: HashMap<String, i32>,

    /// Ports requested under a name
    pub named_ports: HashMap<String, u16>,

    /// Seconds the application asked for between STOPPING and its exit
    pub stopping_time: Option<i32>,

    /// A stop was requested
    pub stop_requested: bool,

    /// When the application was attached
    pub attached_at: Instant,
}

impl AppEntry {
    /// Create a running entry
    pub(super) fn new(id: i32, name: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            id,
            name: name.into(),
            pid,
            state: State::Running,
            past_states: State::Running.into(),
            exit_code: None,
            result: None,
            keys: HashMap::new(),
            publishers: HashMap::new(),
            named_ports: HashMap::new(),
            stopping_time: None,
            stop_requested: false,
            attached_at: Instant::now(),
        }
    }

    /// Check if the application has not terminated
    pub fn is_alive(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Move to `state`, returning the status event to publish
    ///
    /// Returns `None` when the state does not change.
    pub(super) fn transition(&mut self, state: State) -> Option<Event> {
        if self.state == state {
            return None;
        }

        self.state = state;
        self.past_states |= state;

        if state.is_terminal() {
            // Keys of terminated applications are discarded without events.
            self.keys.clear();
            self.publishers.clear();
            self.named_ports.clear();
        }

        tracing::debug!(app = %self.name, id = self.id, state = %state, "State changed");

        Some(self.status_event())
    }

    /// Status event describing the current state
    pub fn status_event(&self) -> Event {
        Event::Status(StatusEvent {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            past_states: self.past_states,
            exit_code: self.exit_code,
        })
    }

    /// Description returned by `connect` and `list`
    pub fn info(&self) -> ApplicationInfo {
        ApplicationInfo {
            id: self.id,
            name: self.name.clone(),
            application_state: self.state.bits(),
            past_application_states: self.past_states.bits(),
            args: String::new(),
            pid: self.pid,
        }
    }

    /// Body returned by `get_status`
    pub fn status(&self) -> StatusBody {
        StatusBody {
            id: self.id,
            name: self.name.clone(),
            application_state: self.state.bits(),
            past_application_states: self.past_states.bits(),
            exit_code: self.exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_running() {
        let entry = AppEntry::new(1, "app", Some(42));

        assert!(entry.is_alive());
        assert_eq!(entry.state, State::Running);
        assert!(entry.past_states.contains(State::Running));
        assert_eq!(entry.info().pid, Some(42));
    }

    #[test]
    fn test_transition_accumulates_past_states() {
        let mut entry = AppEntry::new(1, "app", None);
        entry.keys.insert("k".into(), "v".into());

        let event = entry.transition(State::Stopping).unwrap();
        assert!(matches!(event, Event::Status(ref s) if s.state == State::Stopping));
        assert!(entry.transition(State::Stopping).is_none());

        entry.transition(State::Stopped);
        assert!(!entry.is_alive());
        assert!(entry.keys.is_empty());
        assert_eq!(
            entry.past_states,
            State::Running | State::Stopping | State::Stopped
        );
    }
}
