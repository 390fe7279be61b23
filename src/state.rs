//! Application lifecycle states
//!
//! Every state is a single bit so that the set of states an application has
//! gone through can be carried as one integer (`past_states`).
//!
//! ```text
//!  STARTING ──► RUNNING ──► STOPPING ──► STOPPED
//!      │            │  └──► KILLING ───► KILLED
//!      │            └─────► PROCESSING_FAILURE ──► FAILURE
//!      └──────────────────────────────────────────► SUCCESS
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Lifecycle state of an application instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum State {
    /// No state observed yet (also the state of an instance that never existed)
    #[default]
    Unknown = 0,
    Starting = 1,
    Running = 2,
    Stopping = 4,
    Killing = 8,
    ProcessingFailure = 16,
    Failure = 32,
    Success = 64,
    Stopped = 128,
    Killed = 256,
}

impl State {
    /// All non-unknown states in bit order
    pub const ALL: [State; 9] = [
        State::Starting,
        State::Running,
        State::Stopping,
        State::Killing,
        State::ProcessingFailure,
        State::Failure,
        State::Success,
        State::Stopped,
        State::Killed,
    ];

    /// Bit value of the state
    pub fn bits(self) -> u32 {
        self as u32
    }

    /// Decode a state from its bit value
    ///
    /// Values that are not exactly one known bit decode to `Unknown`.
    pub fn from_bits(bits: u32) -> Self {
        State::ALL
            .iter()
            .copied()
            .find(|s| s.bits() == bits)
            .unwrap_or(State::Unknown)
    }

    /// No lifecycle transition follows a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Success | State::Stopped | State::Killed | State::Failure
        )
    }

    /// Upper-case name used in logs and listings
    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Starting => "STARTING",
            State::Running => "RUNNING",
            State::Stopping => "STOPPING",
            State::Killing => "KILLING",
            State::ProcessingFailure => "PROCESSING_FAILURE",
            State::Failure => "FAILURE",
            State::Success => "SUCCESS",
            State::Stopped => "STOPPED",
            State::Killed => "KILLED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of states, as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StateMask(u32);

impl StateMask {
    /// The empty set
    pub const EMPTY: StateMask = StateMask(0);

    /// Mask matching any terminal state
    pub const TERMINAL: StateMask = StateMask(
        State::Success as u32 | State::Stopped as u32 | State::Killed as u32 | State::Failure as u32,
    );

    /// Build a mask from raw bits (unknown bits are kept as-is)
    pub fn from_bits(bits: u32) -> Self {
        StateMask(bits)
    }

    /// Raw bits
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Check if the mask has no bit set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check if the state is in the set
    pub fn contains(self, state: State) -> bool {
        self.0 & state.bits() != 0
    }

    /// Check if the two sets share at least one state
    pub fn intersects(self, other: StateMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Add a state to the set
    pub fn insert(&mut self, state: State) {
        self.0 |= state.bits();
    }

    /// States in the set, in bit order
    pub fn states(self) -> impl Iterator<Item = State> {
        State::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl From<State> for StateMask {
    fn from(state: State) -> Self {
        StateMask(state.bits())
    }
}

impl BitOr for StateMask {
    type Output = StateMask;

    fn bitor(self, rhs: StateMask) -> StateMask {
        StateMask(self.0 | rhs.0)
    }
}

impl BitOr<State> for StateMask {
    type Output = StateMask;

    fn bitor(self, rhs: State) -> StateMask {
        StateMask(self.0 | rhs.bits())
    }
}

impl BitOr for State {
    type Output = StateMask;

    fn bitor(self, rhs: State) -> StateMask {
        StateMask(self.bits() | rhs.bits())
    }
}

impl BitOrAssign for StateMask {
    fn bitor_assign(&mut self, rhs: StateMask) {
        self.0 |= rhs.0;
    }
}

impl BitOrAssign<State> for StateMask {
    fn bitor_assign(&mut self, rhs: State) {
        self.0 |= rhs.bits();
    }
}

impl fmt::Display for StateMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.states().map(State::as_str).collect();
        if names.is_empty() {
            f.write_str(State::Unknown.as_str())
        } else {
            f.write_str(&names.join("|"))
        }
    }
}
