//! Conversational turn arbitration.
//!
//! The backend decides whose turn it is. The arbiter only mirrors its
//! signals and tells local consumers whether user input may flow.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::events::{Listeners, Subscription};

/// Party currently holding the conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnHolder {
    User,
    Agent,
}

impl fmt::Display for TurnHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnHolder::User => write!(f, "user"),
            TurnHolder::Agent => write!(f, "agent"),
        }
    }
}

/// Turn signal received from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnSignal {
    UserTurnStart,
    UserTurnEnd,
    AgentTurnStart,
    AgentTurnEnd,
}

/// Notification sent to turn listeners on every actual change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnChange {
    pub holder: TurnHolder,
    pub can_send_input: bool,
    /// Signal that caused the change; `None` for a reset.
    pub signal: Option<TurnSignal>,
}

/// Tracks who holds the turn.
pub struct TurnArbiter {
    initial: TurnHolder,
    holder: RwLock<TurnHolder>,
    listeners: Listeners<TurnChange>,
}

impl TurnArbiter {
    /// Create an arbiter. `user_starts_with_turn` picks the initial holder.
    pub fn new(user_starts_with_turn: bool) -> Self {
        let initial = if user_starts_with_turn {
            TurnHolder::User
        } else {
            TurnHolder::Agent
        };
        Self {
            initial,
            holder: RwLock::new(initial),
            listeners: Listeners::new(),
        }
    }

    pub fn holder(&self) -> TurnHolder {
        *self.holder.read()
    }

    /// Whether the user may currently send input.
    pub fn can_send_input(&self) -> bool {
        self.holder() == TurnHolder::User
    }

    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TurnChange) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Apply a backend signal. Returns true when the holder changed.
    ///
    /// `agent_turn_end` hands nothing to the user; the backend grants the
    /// user turn explicitly with `user_turn_start`.
    pub fn apply(&self, signal: TurnSignal) -> bool {
        let next = match signal {
            TurnSignal::UserTurnStart => TurnHolder::User,
            TurnSignal::UserTurnEnd | TurnSignal::AgentTurnStart => TurnHolder::Agent,
            TurnSignal::AgentTurnEnd => {
                debug!("agent_turn_end received, waiting for user_turn_start");
                return false;
            }
        };
        self.transition(next, Some(signal))
    }

    /// Return to the initial holder.
    pub fn reset(&self) -> bool {
        self.transition(self.initial, None)
    }

    fn transition(&self, next: TurnHolder, signal: Option<TurnSignal>) -> bool {
        {
            let mut holder = self.holder.write();
            if *holder == next {
                return false;
            }
            *holder = next;
        }

        debug!(holder = %next, ?signal, "Turn changed");
        self.listeners.emit(&TurnChange {
            holder: next,
            can_send_input: next == TurnHolder::User,
            signal,
        });
        true
    }

    /// Drop every turn listener.
    pub(crate) fn clear_listeners(&self) {
        self.listeners.clear();
    }
}
