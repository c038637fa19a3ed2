//! Multicast socket assembly
//!
//! All the socket2-level plumbing shared by the sender and receiver:
//! reuse-address binding, TTL/loopback/interface options, and ASM/SSM group
//! membership. IPv6 source-specific joins have no portable socket API and
//! fail with `NotSupported`.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tapestry_core::endpoint::{MulticastEndpoint, SourceFilter};
use tapestry_core::error::{Result, TransportError};
use tokio::net::UdpSocket;
use tracing::debug;

fn io_err(context: &str, e: std::io::Error) -> TransportError {
    TransportError::NotSupported(format!("{}: {}", context, e))
}

/// Bind a nonblocking, reuse-address UDP socket for multicast use
pub(crate) fn bind_socket(endpoint: &MulticastEndpoint, bind: SocketAddr) -> Result<Socket> {
    let domain = if endpoint.group.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| io_err("multicast socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| io_err("SO_REUSEADDR", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| io_err("nonblocking mode", e))?;
    socket
        .bind(&bind.into())
        .map_err(|e| io_err("multicast bind", e))?;
    Ok(socket)
}

/// Apply TTL, loopback, and outgoing-interface options
pub(crate) fn apply_send_options(socket: &Socket, endpoint: &MulticastEndpoint) -> Result<()> {
    if endpoint.group.is_ipv4() {
        socket
            .set_multicast_ttl_v4(endpoint.ttl as u32)
            .map_err(|e| io_err("IP_MULTICAST_TTL", e))?;
        socket
            .set_multicast_loop_v4(endpoint.loopback)
            .map_err(|e| io_err("IP_MULTICAST_LOOP", e))?;
        if let Some(iface) = interface_v4(endpoint)? {
            socket
                .set_multicast_if_v4(&iface)
                .map_err(|e| io_err("IP_MULTICAST_IF", e))?;
        }
    } else {
        socket
            .set_multicast_hops_v6(endpoint.ttl as u32)
            .map_err(|e| io_err("IPV6_MULTICAST_HOPS", e))?;
        socket
            .set_multicast_loop_v6(endpoint.loopback)
            .map_err(|e| io_err("IPV6_MULTICAST_LOOP", e))?;
        if let Some(index) = interface_v6(endpoint)? {
            socket
                .set_multicast_if_v6(index)
                .map_err(|e| io_err("IPV6_MULTICAST_IF", e))?;
        }
    }
    Ok(())
}

/// Join the group: ASM membership or one SSM join per source
pub(crate) fn join_group(socket: &Socket, endpoint: &MulticastEndpoint) -> Result<()> {
    match (&endpoint.group, &endpoint.filter) {
        (IpAddr::V4(group), SourceFilter::AnySource) => {
            let iface = interface_v4(endpoint)?.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket
                .join_multicast_v4(group, &iface)
                .map_err(|e| io_err("IP_ADD_MEMBERSHIP", e))?;
            debug!(%group, "joined any-source multicast group");
        }
        (IpAddr::V4(group), SourceFilter::SourceSpecific(sources)) => {
            let iface = interface_v4(endpoint)?.unwrap_or(Ipv4Addr::UNSPECIFIED);
            for source in sources {
                let IpAddr::V4(source) = source else {
                    return Err(TransportError::InvalidConfiguration(format!(
                        "source {} does not match the group family",
                        source
                    )));
                };
                socket
                    .join_ssm_v4(source, group, &iface)
                    .map_err(|e| io_err("source-specific join", e))?;
                debug!(%group, %source, "joined source-specific multicast group");
            }
        }
        (IpAddr::V6(group), SourceFilter::AnySource) => {
            let index = interface_v6(endpoint)?.unwrap_or(0);
            socket
                .join_multicast_v6(group, index)
                .map_err(|e| io_err("IPV6_JOIN_GROUP", e))?;
            debug!(%group, "joined any-source multicast group");
        }
        (IpAddr::V6(_), SourceFilter::SourceSpecific(_)) => {
            return Err(TransportError::NotSupported(
                "source-specific multicast over IPv6".to_string(),
            ));
        }
    }
    Ok(())
}

/// Convert into a tokio socket
pub(crate) fn into_tokio(socket: Socket) -> Result<UdpSocket> {
    UdpSocket::from_std(socket.into()).map_err(|e| io_err("tokio socket registration", e))
}

/// Resolve the interface hint for IPv4: a literal address or a name
fn interface_v4(endpoint: &MulticastEndpoint) -> Result<Option<Ipv4Addr>> {
    let Some(hint) = &endpoint.interface else {
        return Ok(None);
    };
    if let Ok(addr) = hint.parse::<Ipv4Addr>() {
        return Ok(Some(addr));
    }
    match tapestry_connection::resolve::interface_addr_for(hint) {
        Some(IpAddr::V4(addr)) => Ok(Some(addr)),
        _ => Err(TransportError::NotSupported(format!(
            "cannot resolve interface hint {} to an IPv4 address",
            hint
        ))),
    }
}

/// Resolve the interface hint for IPv6: a numeric interface index
fn interface_v6(endpoint: &MulticastEndpoint) -> Result<Option<u32>> {
    let Some(hint) = &endpoint.interface else {
        return Ok(None);
    };
    hint.parse::<u32>().map(Some).map_err(|_| {
        TransportError::NotSupported(format!(
            "IPv6 multicast interface hint {} is not an interface index",
            hint
        ))
    })
}
