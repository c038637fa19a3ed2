//! Protocol stack trait abstraction
//!
//! Defines a common interface for transport backends (TCP, UDP, TLS/TCP,
//! further stacks by registration) so candidate gathering and racing can
//! drive them uniformly. The core never branches on stack identity outside
//! ranking: feasibility and preference scoring both go through the
//! capability set declared here.

use crate::channel::{Channel, ServerChannel};
use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use tapestry_core::endpoint::Endpoint;
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::SecurityParameters;

/// What a stack can provide, as consulted by require/prohibit filtering and
/// prefer/avoid ranking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackCapabilities {
    pub reliability: bool,
    pub ordering: bool,
    pub message_boundaries: bool,
    pub congestion_control: bool,
    pub keep_alive: bool,
    pub security: bool,
    pub multipath: bool,
    pub low_power: bool,
    pub multicast: bool,
    pub zero_rtt: bool,
}

impl StackCapabilities {
    /// Feasibility: no `Require` lacks its capability, no `Prohibit` has it
    pub fn satisfies(&self, properties: &TransportProperties) -> bool {
        properties.reliability.is_satisfied_by(self.reliability)
            && properties.preserve_order.is_satisfied_by(self.ordering)
            && properties
                .preserve_msg_boundaries
                .is_satisfied_by(self.message_boundaries)
            && properties
                .congestion_control
                .is_satisfied_by(self.congestion_control)
            && properties.keep_alive.is_satisfied_by(self.keep_alive)
            && properties.prefer_low_power.is_satisfied_by(self.low_power)
            && properties.zero_rtt.is_satisfied_by(self.zero_rtt)
    }

    /// Ranking: sum of prefer/avoid contributions over all capability axes
    pub fn score(&self, properties: &TransportProperties) -> i32 {
        use tapestry_core::properties::MultipathMode;

        let mut score = properties.reliability.score(self.reliability)
            + properties.preserve_order.score(self.ordering)
            + properties
                .preserve_msg_boundaries
                .score(self.message_boundaries)
            + properties.congestion_control.score(self.congestion_control)
            + properties.keep_alive.score(self.keep_alive)
            + properties.prefer_low_power.score(self.low_power)
            + properties.zero_rtt.score(self.zero_rtt);

        if properties.multipath_mode != MultipathMode::Disabled && self.multipath {
            score += 1;
        }
        score
    }
}

/// A transport backend
///
/// Implementations must be independent of each other: everything the core
/// needs to choose between them flows through `capabilities`, `can_handle`,
/// and `priority`.
#[async_trait]
pub trait ProtocolStack: Send + Sync {
    /// Stack name (e.g., "tcp", "tls-tcp")
    fn name(&self) -> &'static str;

    /// Capability set consulted during gathering
    fn capabilities(&self) -> StackCapabilities;

    /// Whether this stack can reach the given endpoint at all
    fn can_handle(&self, endpoint: &Endpoint) -> bool;

    /// Preference score for ranking; higher ranks earlier
    fn priority(&self, properties: &TransportProperties) -> i32 {
        self.capabilities().score(properties)
    }

    /// Establish an outbound channel
    ///
    /// # Arguments
    /// * `remote` - Resolved remote address
    /// * `server_name` - Name for TLS verification, when the endpoint had one
    /// * `local` - Local address to bind, or `None` for ephemeral
    ///
    /// Cancellable; the per-attempt deadline is enforced by the racer.
    async fn connect(
        &self,
        remote: SocketAddr,
        server_name: Option<&str>,
        local: Option<SocketAddr>,
        properties: &TransportProperties,
        security: &SecurityParameters,
    ) -> Result<Box<dyn Channel>>;

    /// Bind a listening channel
    async fn listen(
        &self,
        local: SocketAddr,
        properties: &TransportProperties,
        security: &SecurityParameters,
    ) -> Result<Box<dyn ServerChannel>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestry_core::properties::Preference;

    fn stream_caps() -> StackCapabilities {
        StackCapabilities {
            reliability: true,
            ordering: true,
            congestion_control: true,
            keep_alive: true,
            ..Default::default()
        }
    }

    fn datagram_caps() -> StackCapabilities {
        StackCapabilities {
            message_boundaries: true,
            multicast: true,
            zero_rtt: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_require_eliminates_missing_capability() {
        let props = TransportProperties::default(); // reliability: Require
        assert!(stream_caps().satisfies(&props));
        assert!(!datagram_caps().satisfies(&props));
    }

    #[test]
    fn test_prohibit_eliminates_present_capability() {
        let props = TransportProperties::unreliable_datagram(); // reliability: Prohibit
        assert!(!stream_caps().satisfies(&props));
        assert!(datagram_caps().satisfies(&props));
    }

    #[test]
    fn test_prefer_affects_score_not_feasibility() {
        let mut props = TransportProperties::default();
        props.preserve_msg_boundaries = Preference::Prefer;

        assert!(stream_caps().satisfies(&props));
        let without = stream_caps().score(&props);
        let with = StackCapabilities {
            message_boundaries: true,
            ..stream_caps()
        }
        .score(&props);
        assert!(with > without);
    }
}
