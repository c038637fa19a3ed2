//! Connection state machine with validated transitions
//!
//! States and permitted transitions:
//!
//! ```text
//! establishing -> established -> closing -> closed
//! establishing -> closed           (establishment failure)
//! established  -> closed           (abort or peer reset)
//! closing      -> closed
//! ```
//!
//! No backward transitions exist; `Closed` is terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use tapestry_core::error::{Result, TransportError};

/// Lifecycle states of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Candidate racing / handshake in progress
    Establishing,

    /// Ready; send and receive are permitted
    Established,

    /// Graceful shutdown in progress; no new sends accepted
    Closing,

    /// Terminal state
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Establishing => "establishing",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// State holder enforcing the transition graph
#[derive(Debug)]
pub struct StateMachine {
    current: ConnectionState,
}

impl StateMachine {
    /// New machine in `Establishing`
    pub fn new() -> Self {
        Self {
            current: ConnectionState::Establishing,
        }
    }

    /// Machine starting from a given state (accepted channels are already
    /// established when they surface)
    pub fn from_state(state: ConnectionState) -> Self {
        Self { current: state }
    }

    pub fn state(&self) -> ConnectionState {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.current == ConnectionState::Closed
    }

    /// Whether `to` is reachable in one step from the current state
    pub fn can_transition(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self.current, to),
            (Establishing, Established)
                | (Establishing, Closed)
                | (Establishing, Closing)
                | (Established, Closing)
                | (Established, Closed)
                | (Closing, Closed)
        )
    }

    /// Attempt a transition
    ///
    /// # Errors
    /// Returns `TransportError::InvalidState` when the edge is not in the
    /// transition graph.
    pub fn transition(&mut self, to: ConnectionState) -> Result<ConnectionState> {
        if !self.can_transition(to) {
            return Err(TransportError::InvalidState {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }
        self.current = to;
        Ok(to)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
