//! Endpoint descriptors
//!
//! Endpoints name the places a connection runs between: a host name waiting
//! for resolution, a literal IP address, or a Bluetooth service/peripheral.
//! `LocalEndpoint` and `RemoteEndpoint` share the same representation; the
//! semantics differ only in role (bind vs. connect target).

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// The identifying part of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EndpointKind {
    /// Host name to be resolved via DNS (A + AAAA)
    HostName(String),

    /// Literal IPv4/IPv6 address; never resolved
    Ip(IpAddr),

    /// Bluetooth L2CAP service identified by UUID, with an optional PSM
    BluetoothService { uuid: Uuid, psm: Option<u16> },

    /// Bluetooth peripheral identified by UUID, with an optional PSM
    BluetoothPeripheral { uuid: Uuid, psm: Option<u16> },
}

/// A local or remote endpoint
///
/// At least one identifier is always present (the kind is a tagged union);
/// `port` is required for connect and optional for bind (absent or 0 means
/// ephemeral); `interface` is a hint consumed by candidate gathering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub port: Option<u16>,
    pub interface: Option<String>,
}

/// Endpoint in the local (bind) role
pub type LocalEndpoint = Endpoint;

/// Endpoint in the remote (connect) role
pub type RemoteEndpoint = Endpoint;

impl Endpoint {
    /// Endpoint identified by host name
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::HostName(name.into()),
            port: None,
            interface: None,
        }
    }

    /// Endpoint identified by literal IP address
    pub fn ip(addr: IpAddr) -> Self {
        Self {
            kind: EndpointKind::Ip(addr),
            port: None,
            interface: None,
        }
    }

    /// Endpoint identified by a Bluetooth service UUID
    pub fn bluetooth_service(uuid: Uuid, psm: Option<u16>) -> Self {
        Self {
            kind: EndpointKind::BluetoothService { uuid, psm },
            port: None,
            interface: None,
        }
    }

    /// Endpoint identified by a Bluetooth peripheral UUID
    pub fn bluetooth_peripheral(uuid: Uuid, psm: Option<u16>) -> Self {
        Self {
            kind: EndpointKind::BluetoothPeripheral { uuid, psm },
            port: None,
            interface: None,
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the interface hint (e.g., "eth0")
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Host name, if this endpoint needs resolution
    pub fn host_name(&self) -> Option<&str> {
        match &self.kind {
            EndpointKind::HostName(name) => Some(name),
            _ => None,
        }
    }

    /// Literal IP address, if present
    pub fn ip_addr(&self) -> Option<IpAddr> {
        match &self.kind {
            EndpointKind::Ip(addr) => Some(*addr),
            _ => None,
        }
    }

    /// True for host-name endpoints (DNS required before gathering)
    pub fn requires_resolution(&self) -> bool {
        matches!(self.kind, EndpointKind::HostName(_))
    }

    /// True for IP-family endpoints (host name or literal address)
    pub fn is_ip_family(&self) -> bool {
        matches!(self.kind, EndpointKind::HostName(_) | EndpointKind::Ip(_))
    }

    /// Socket address, when the endpoint is a literal IP with a port
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match (&self.kind, self.port) {
            (EndpointKind::Ip(addr), Some(port)) => Some(SocketAddr::new(*addr, port)),
            _ => None,
        }
    }

    /// Check the connect-role invariant: a port must be present
    pub fn validate_for_connect(&self) -> Result<()> {
        if self.is_ip_family() && self.port.is_none() {
            return Err(TransportError::InvalidConfiguration(format!(
                "remote endpoint {} has no port",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EndpointKind::HostName(name) => write!(f, "{}", name)?,
            EndpointKind::Ip(addr) => write!(f, "{}", addr)?,
            EndpointKind::BluetoothService { uuid, .. } => write!(f, "bt-service:{}", uuid)?,
            EndpointKind::BluetoothPeripheral { uuid, .. } => write!(f, "bt-peripheral:{}", uuid)?,
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Source filtering mode for multicast reception
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "sources", rename_all = "snake_case")]
pub enum SourceFilter {
    /// Any-source multicast (ASM)
    AnySource,

    /// Source-specific multicast (SSM); sources must be non-empty
    SourceSpecific(Vec<IpAddr>),
}

/// A multicast group endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastEndpoint {
    pub group: IpAddr,
    pub port: u16,
    pub ttl: u8,
    pub loopback: bool,
    pub filter: SourceFilter,
    pub interface: Option<String>,
}

impl MulticastEndpoint {
    /// Multicast endpoint with default TTL (1), loopback off, any-source
    pub fn new(group: IpAddr, port: u16) -> Self {
        Self {
            group,
            port,
            ttl: 1,
            loopback: false,
            filter: SourceFilter::AnySource,
            interface: None,
        }
    }

    /// Set the time-to-live / hop limit
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Enable or disable local loopback of sent datagrams
    pub fn with_loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    /// Restrict reception to the given sources (SSM)
    pub fn with_sources(mut self, sources: Vec<IpAddr>) -> Self {
        self.filter = SourceFilter::SourceSpecific(sources);
        self
    }

    /// Set the outgoing interface hint
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Validate the group address and source filter
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` when the group address is not a
    /// multicast address, when an SSM filter has no sources, or when a source
    /// address family does not match the group's.
    pub fn validate(&self) -> Result<()> {
        if !self.group.is_multicast() {
            return Err(TransportError::InvalidConfiguration(format!(
                "{} is not a multicast address",
                self.group
            )));
        }
        if let SourceFilter::SourceSpecific(sources) = &self.filter {
            if sources.is_empty() {
                return Err(TransportError::InvalidConfiguration(
                    "source-specific multicast requires at least one source".to_string(),
                ));
            }
            for source in sources {
                if source.is_ipv4() != self.group.is_ipv4() {
                    return Err(TransportError::InvalidConfiguration(format!(
                        "source {} does not match the address family of group {}",
                        source, self.group
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for MulticastEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_host_endpoint() {
        let ep = Endpoint::host("example.com").with_port(443);
        assert_eq!(ep.host_name(), Some("example.com"));
        assert!(ep.requires_resolution());
        assert!(ep.is_ip_family());
        assert_eq!(ep.to_string(), "example.com:443");
        assert!(ep.validate_for_connect().is_ok());
    }

    #[test]
    fn test_ip_endpoint_socket_addr() {
        let ep = Endpoint::ip(IpAddr::V4(Ipv4Addr::LOCALHOST)).with_port(8080);
        assert!(!ep.requires_resolution());
        assert_eq!(ep.socket_addr(), Some("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_connect_requires_port() {
        let ep = Endpoint::ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(matches!(
            ep.validate_for_connect(),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_bluetooth_endpoint_display() {
        let uuid = Uuid::now_v7();
        let ep = Endpoint::bluetooth_service(uuid, Some(0x25));
        assert!(!ep.is_ip_family());
        assert!(ep.to_string().starts_with("bt-service:"));
    }

    #[test]
    fn test_multicast_validate_group() {
        let ep = MulticastEndpoint::new("239.1.2.3".parse().unwrap(), 5000);
        assert!(ep.validate().is_ok());

        let ep = MulticastEndpoint::new("10.0.0.1".parse().unwrap(), 5000);
        assert!(ep.validate().is_err());
    }

    #[test]
    fn test_multicast_ssm_requires_sources() {
        let ep = MulticastEndpoint::new("239.1.2.3".parse().unwrap(), 5000).with_sources(vec![]);
        assert!(ep.validate().is_err());

        let ep = MulticastEndpoint::new("239.1.2.3".parse().unwrap(), 5000)
            .with_sources(vec!["192.0.2.10".parse().unwrap()]);
        assert!(ep.validate().is_ok());
    }

    #[test]
    fn test_multicast_ssm_family_mismatch() {
        let ep = MulticastEndpoint::new("239.1.2.3".parse().unwrap(), 5000)
            .with_sources(vec!["2001:db8::1".parse().unwrap()]);
        assert!(ep.validate().is_err());
    }

    #[test]
    fn test_endpoint_serde_round_trip() {
        let ep = Endpoint::host("peer.local").with_port(7000).with_interface("eth0");
        let json = serde_json::to_string(&ep).unwrap();
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(ep, back);
    }
}
