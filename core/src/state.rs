// Connection lifecycle — one state variable, serialized transitions

use crate::DelegateSlot;
use parking_lot::Mutex;
use std::fmt;
use tracing::debug;

/// Where one membership session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No join attempted yet (or a fresh session restarting).
    #[default]
    Undefined,
    /// Configuration accepted, transport registration under way.
    Joining,
    /// The mesh reports this node reachable; sends are allowed.
    Online,
    /// Cleanly logged out or knocked offline by the transport.
    Offline,
    /// A fault ended the session; only a new join recovers.
    Error,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Undefined => "Undefined",
            LinkState::Joining => "Joining",
            LinkState::Online => "Online",
            LinkState::Offline => "Offline",
            LinkState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// One transition notification.
#[derive(Debug, Clone)]
pub struct StateChange {
    /// Value of the state variable immediately before the overwrite.
    pub old: LinkState,
    pub new: LinkState,
    /// Rendering of the fault that forced the transition, when one did.
    pub cause: Option<String>,
    /// Short note ("Logged in", "Logout", "Error sending message", ...).
    pub note: String,
}

/// The single source of truth for connection state.
///
/// One mutex covers read-old, overwrite, and notification dispatch, so the
/// `old` recorded in each notification is exact and notifications form a
/// total order matching the transitions, even when transport signals and
/// application calls race.
#[derive(Debug, Default)]
pub(crate) struct StateMachine {
    current: Mutex<LinkState>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn current(&self) -> LinkState {
        *self.current.lock()
    }

    /// Overwrite the state and notify the delegate under the same critical
    /// section. A panicking subscriber is contained by the slot, and the
    /// mutex does not poison, so later transitions always proceed.
    pub(crate) fn transition(
        &self,
        new: LinkState,
        cause: Option<String>,
        note: &str,
        delegate: &DelegateSlot,
    ) -> StateChange {
        let mut current = self.current.lock();
        let old = *current;
        *current = new;

        let change = StateChange {
            old,
            new,
            cause,
            note: note.to_string(),
        };
        debug!(from = %old, to = %new, note, "connection state transition");
        delegate.notify_state_changed(&change);
        change
    }
}
