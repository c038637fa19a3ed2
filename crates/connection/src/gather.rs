//! Candidate gathering
//!
//! Crosses the registered stacks with the resolved endpoints into a ranked
//! candidate list. Feasibility first: a stack violating any `Require` or
//! `Prohibit`, or mismatching the security mode, is discarded before any
//! candidate is built — every survivor satisfies every hard constraint.
//! Ranking then orders survivors by stack preference score, address family
//! (IPv6 first), and interface cost, with insertion order as the
//! deterministic tiebreak.

use crate::resolve::{ResolvedLocal, ResolvedRemote};
use std::cmp::Reverse;
use std::sync::Arc;
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::SecurityParameters;
use tapestry_transport::{ProtocolStack, StackRegistry};
use tracing::debug;

/// A concrete (stack, remote address, local binding) establishment option
#[derive(Clone)]
pub struct Candidate {
    pub stack: Arc<dyn ProtocolStack>,
    pub remote: ResolvedRemote,
    pub local: Option<ResolvedLocal>,
    /// Stack preference score used for ranking
    pub score: i32,
}

impl Candidate {
    /// Server name for TLS verification, when the remote endpoint had one
    pub fn server_name(&self) -> Option<&str> {
        self.remote.endpoint.host_name()
    }

    fn interface_cost(&self) -> u8 {
        match &self.local {
            Some(local) if local.addr.ip().is_loopback() => 0,
            None => 1,
            Some(_) => 2,
        }
    }
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("stack", &self.stack.name())
            .field("remote", &self.remote.addr)
            .field("local", &self.local.as_ref().map(|l| l.addr))
            .field("score", &self.score)
            .finish()
    }
}

/// Build the ranked candidate list
///
/// `include_ephemeral_local` additionally pairs every remote with an
/// ephemeral local binding even when explicit locals exist; rendezvous races
/// over (locals U {ephemeral}) x remotes this way.
pub fn gather_candidates(
    registry: &StackRegistry,
    locals: &[ResolvedLocal],
    remotes: &[ResolvedRemote],
    properties: &TransportProperties,
    security: &SecurityParameters,
    include_ephemeral_local: bool,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for stack in registry.stacks() {
        let caps = stack.capabilities();
        if !caps.satisfies(properties) {
            debug!(stack = stack.name(), "stack eliminated by require/prohibit");
            continue;
        }
        // TLS-capable stacks need parameters to drive them; plaintext stacks
        // cannot satisfy an enabled security mode.
        if caps.security != security.is_enabled() {
            debug!(stack = stack.name(), "stack eliminated by security mode");
            continue;
        }

        let score = stack.priority(properties);
        for remote in remotes {
            if !stack.can_handle(&remote.endpoint) {
                continue;
            }

            let matching_locals: Vec<&ResolvedLocal> = locals
                .iter()
                .filter(|l| l.addr.ip().is_ipv4() == remote.addr.ip().is_ipv4())
                .collect();

            for local in &matching_locals {
                candidates.push(Candidate {
                    stack: stack.clone(),
                    remote: remote.clone(),
                    local: Some((*local).clone()),
                    score,
                });
            }
            if matching_locals.is_empty() || include_ephemeral_local {
                candidates.push(Candidate {
                    stack: stack.clone(),
                    remote: remote.clone(),
                    local: None,
                    score,
                });
            }
        }
    }

    // Stable sort keeps insertion order as the final tiebreak.
    candidates.sort_by_key(|c| {
        (
            Reverse(c.score),
            c.remote.addr.is_ipv4(), // IPv6 (false) sorts first
            c.interface_cost(),
        )
    });

    debug!(count = candidates.len(), "gathered candidates");
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestry_core::endpoint::Endpoint;
    use tapestry_core::properties::Preference;

    fn remote(addr: &str) -> ResolvedRemote {
        let addr: std::net::SocketAddr = addr.parse().unwrap();
        ResolvedRemote {
            addr,
            endpoint: Endpoint::ip(addr.ip()).with_port(addr.port()),
        }
    }

    fn registry() -> StackRegistry {
        StackRegistry::with_defaults()
    }

    #[test]
    fn test_reliable_defaults_select_tcp_only() {
        let candidates = gather_candidates(
            &registry(),
            &[],
            &[remote("127.0.0.1:9000")],
            &TransportProperties::default(),
            &SecurityParameters::disabled(),
            false,
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].stack.name(), "tcp");
    }

    #[test]
    fn test_security_enabled_selects_tls() {
        let candidates = gather_candidates(
            &registry(),
            &[],
            &[remote("127.0.0.1:9000")],
            &TransportProperties::default(),
            &SecurityParameters::new(),
            false,
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].stack.name(), "tls-tcp");
    }

    #[test]
    fn test_prohibit_reliability_selects_udp() {
        let candidates = gather_candidates(
            &registry(),
            &[],
            &[remote("127.0.0.1:9000")],
            &TransportProperties::unreliable_datagram(),
            &SecurityParameters::disabled(),
            false,
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].stack.name(), "udp");
    }

    #[test]
    fn test_zero_rtt_require_with_reliability_yields_nothing() {
        let mut props = TransportProperties::default();
        props.zero_rtt = Preference::Require;
        let candidates = gather_candidates(
            &registry(),
            &[],
            &[remote("127.0.0.1:9000")],
            &props,
            &SecurityParameters::disabled(),
            false,
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_ipv6_ranks_before_ipv4() {
        let candidates = gather_candidates(
            &registry(),
            &[],
            &[remote("127.0.0.1:9000"), remote("[::1]:9000")],
            &TransportProperties::default(),
            &SecurityParameters::disabled(),
            false,
        );
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].remote.addr.is_ipv6());
        assert!(candidates[1].remote.addr.is_ipv4());
    }

    #[test]
    fn test_insertion_order_breaks_ties() {
        let candidates = gather_candidates(
            &registry(),
            &[],
            &[remote("127.0.0.1:9000"), remote("127.0.0.2:9000")],
            &TransportProperties::default(),
            &SecurityParameters::disabled(),
            false,
        );
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].remote.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(candidates[1].remote.addr, "127.0.0.2:9000".parse().unwrap());
    }

    #[test]
    fn test_family_mismatched_locals_fall_back_to_ephemeral() {
        let locals = vec![ResolvedLocal {
            addr: "[::1]:0".parse().unwrap(),
            interface: None,
        }];
        let candidates = gather_candidates(
            &registry(),
            &locals,
            &[remote("127.0.0.1:9000")],
            &TransportProperties::default(),
            &SecurityParameters::disabled(),
            false,
        );
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].local.is_none());
    }

    #[test]
    fn test_ephemeral_added_for_rendezvous() {
        let locals = vec![ResolvedLocal {
            addr: "127.0.0.1:7001".parse().unwrap(),
            interface: None,
        }];
        let candidates = gather_candidates(
            &registry(),
            &locals,
            &[remote("127.0.0.1:9000")],
            &TransportProperties::default(),
            &SecurityParameters::disabled(),
            true,
        );
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().any(|c| c.local.is_some()));
        assert!(candidates.iter().any(|c| c.local.is_none()));
    }
}
