//! Transport properties
//!
//! Applications describe the transport service they want as a set of
//! preference-valued options. During candidate gathering, `Require` and
//! `Prohibit` are feasibility constraints (candidates violating them are
//! discarded), while `Prefer` and `Avoid` only influence ranking.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound on the whole establishment, when none is configured
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(30);

/// Preference level for a selection property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    /// Select only stacks providing the capability; otherwise fail
    Require,
    /// Prefer stacks providing the capability
    Prefer,
    /// No preference
    NoPreference,
    /// Prefer stacks not providing the capability
    Avoid,
    /// Select only stacks not providing the capability; otherwise fail
    Prohibit,
}

impl Preference {
    /// Feasibility check: does a stack with (`available`) the capability
    /// satisfy this preference?
    pub fn is_satisfied_by(&self, available: bool) -> bool {
        match self {
            Preference::Require => available,
            Preference::Prohibit => !available,
            _ => true,
        }
    }

    /// Ranking contribution for a stack with (`available`) the capability
    pub fn score(&self, available: bool) -> i32 {
        match (self, available) {
            (Preference::Prefer, true) | (Preference::Avoid, false) => 1,
            (Preference::Prefer, false) | (Preference::Avoid, true) => -1,
            _ => 0,
        }
    }
}

impl Default for Preference {
    fn default() -> Self {
        Preference::NoPreference
    }
}

/// Multipath usage mode (a separate axis, not a preference)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultipathMode {
    Disabled,
    Passive,
    Active,
}

impl Default for MultipathMode {
    fn default() -> Self {
        MultipathMode::Disabled
    }
}

/// Path scheduling policy for multipath-capable stacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultipathPolicy {
    Handover,
    Interactive,
    Aggregate,
}

impl Default for MultipathPolicy {
    fn default() -> Self {
        MultipathPolicy::Handover
    }
}

/// Communication direction of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bidirectional,
    SendOnly,
    RecvOnly,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Bidirectional
    }
}

/// The full selection-property set of a preconnection
///
/// Defaults select a reliable, ordered, congestion-controlled stream — the
/// conventional TCP-like service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportProperties {
    pub reliability: Preference,
    pub preserve_order: Preference,
    pub preserve_msg_boundaries: Preference,
    pub congestion_control: Preference,
    pub keep_alive: Preference,
    pub prefer_low_power: Preference,
    pub zero_rtt: Preference,
    pub disable_nagle: Preference,
    pub multipath_mode: MultipathMode,
    pub multipath_policy: MultipathPolicy,
    pub direction: Direction,
    /// Maximum time to establish; `None` means [`DEFAULT_CONN_TIMEOUT`]
    pub conn_timeout: Option<Duration>,
}

impl Default for TransportProperties {
    fn default() -> Self {
        Self {
            reliability: Preference::Require,
            preserve_order: Preference::Require,
            preserve_msg_boundaries: Preference::NoPreference,
            congestion_control: Preference::Require,
            keep_alive: Preference::NoPreference,
            prefer_low_power: Preference::NoPreference,
            zero_rtt: Preference::NoPreference,
            disable_nagle: Preference::NoPreference,
            multipath_mode: MultipathMode::default(),
            multipath_policy: MultipathPolicy::default(),
            direction: Direction::default(),
            conn_timeout: None,
        }
    }
}

impl TransportProperties {
    /// Reliable, ordered byte stream (the defaults)
    pub fn reliable_stream() -> Self {
        Self::default()
    }

    /// Unreliable datagram service with preserved message boundaries
    pub fn unreliable_datagram() -> Self {
        Self {
            reliability: Preference::Prohibit,
            preserve_order: Preference::NoPreference,
            preserve_msg_boundaries: Preference::Require,
            congestion_control: Preference::NoPreference,
            ..Self::default()
        }
    }

    /// Reliable service that also preserves message boundaries
    pub fn reliable_message() -> Self {
        Self {
            preserve_msg_boundaries: Preference::Require,
            ..Self::default()
        }
    }

    /// The configured establishment bound, or the 30 s default
    pub fn conn_timeout_or_default(&self) -> Duration {
        self.conn_timeout.unwrap_or(DEFAULT_CONN_TIMEOUT)
    }

    /// True when the application may send on this connection
    pub fn can_send(&self) -> bool {
        self.direction != Direction::RecvOnly
    }

    /// True when the application may receive on this connection
    pub fn can_receive(&self) -> bool {
        self.direction != Direction::SendOnly
    }
}
