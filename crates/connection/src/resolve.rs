//! Endpoint resolution
//!
//! Expands a preconnection's endpoints into concrete addresses: host names
//! via DNS (A + AAAA), literal IPs as-is, and unspecified local addresses
//! into one entry per non-loopback interface address. Resolution performs no
//! network I/O beyond DNS.

use std::net::{IpAddr, SocketAddr};
use tapestry_core::endpoint::{EndpointKind, LocalEndpoint, RemoteEndpoint};
use tapestry_core::error::{Result, TransportError};
use tokio::net::lookup_host;
use tracing::debug;

/// A remote endpoint resolved to a dialable address
#[derive(Debug, Clone)]
pub struct ResolvedRemote {
    pub addr: SocketAddr,
    /// The endpoint the address came from; keeps the server name for TLS and
    /// the original target for cloning
    pub endpoint: RemoteEndpoint,
}

/// A local endpoint resolved to a bindable address
#[derive(Debug, Clone)]
pub struct ResolvedLocal {
    pub addr: SocketAddr,
    pub interface: Option<String>,
}

/// Resolve every remote endpoint
///
/// Per-host failures are tolerated as long as at least one remote resolves;
/// the call fails only when all of them do.
pub async fn resolve_remotes(remotes: &[RemoteEndpoint]) -> Result<Vec<ResolvedRemote>> {
    let mut resolved = Vec::new();
    let mut first_error: Option<TransportError> = None;

    for endpoint in remotes {
        endpoint.validate_for_connect()?;
        match &endpoint.kind {
            EndpointKind::Ip(addr) => {
                let port = endpoint.port.expect("validated above");
                resolved.push(ResolvedRemote {
                    addr: SocketAddr::new(*addr, port),
                    endpoint: endpoint.clone(),
                });
            }
            EndpointKind::HostName(host) => {
                let port = endpoint.port.expect("validated above");
                match lookup_host((host.as_str(), port)).await {
                    Ok(addrs) => {
                        let before = resolved.len();
                        for addr in addrs {
                            resolved.push(ResolvedRemote {
                                addr,
                                endpoint: endpoint.clone(),
                            });
                        }
                        debug!(host, count = resolved.len() - before, "resolved remote host");
                    }
                    Err(e) => {
                        let error = TransportError::ResolutionFailure {
                            host: host.clone(),
                            reason: e.to_string(),
                        };
                        debug!(host, error = %error, "remote resolution failed");
                        first_error.get_or_insert(error);
                    }
                }
            }
            // Non-IP endpoints are handled by whichever registered stack
            // claims them; they carry no socket address to resolve.
            _ => {}
        }
    }

    if resolved.is_empty() {
        if let Some(error) = first_error {
            return Err(error);
        }
    }
    Ok(resolved)
}

/// Resolve local endpoints for candidate gathering
///
/// An unspecified address expands into one entry per non-loopback interface
/// address of the same family, so candidates can differ by interface.
pub async fn resolve_locals(locals: &[LocalEndpoint]) -> Result<Vec<ResolvedLocal>> {
    let mut resolved = Vec::new();

    for endpoint in locals {
        let port = endpoint.port.unwrap_or(0);
        match &endpoint.kind {
            EndpointKind::Ip(addr) if addr.is_unspecified() => {
                let before = resolved.len();
                for iface_addr in interface_addresses()? {
                    if iface_addr.is_ipv4() == addr.is_ipv4() {
                        resolved.push(ResolvedLocal {
                            addr: SocketAddr::new(iface_addr, port),
                            interface: endpoint.interface.clone(),
                        });
                    }
                }
                debug!(
                    count = resolved.len() - before,
                    "expanded unspecified local across interfaces"
                );
                // Keep the wildcard itself so binding still works on hosts
                // with no enumerable interfaces.
                if resolved.len() == before {
                    resolved.push(ResolvedLocal {
                        addr: SocketAddr::new(*addr, port),
                        interface: endpoint.interface.clone(),
                    });
                }
            }
            EndpointKind::Ip(addr) => {
                resolved.push(ResolvedLocal {
                    addr: SocketAddr::new(*addr, port),
                    interface: endpoint.interface.clone(),
                });
            }
            EndpointKind::HostName(host) => match lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        resolved.push(ResolvedLocal {
                            addr,
                            interface: endpoint.interface.clone(),
                        });
                    }
                }
                Err(e) => {
                    return Err(TransportError::ResolutionFailure {
                        host: host.clone(),
                        reason: e.to_string(),
                    });
                }
            },
            _ => {}
        }
    }
    Ok(resolved)
}

/// The bind address for a local endpoint in the listener role
///
/// Unlike gathering, listening binds the endpoint itself: a wildcard stays a
/// wildcard, a missing port means ephemeral.
pub fn bind_addr(endpoint: &LocalEndpoint) -> Result<SocketAddr> {
    let port = endpoint.port.unwrap_or(0);
    match &endpoint.kind {
        EndpointKind::Ip(addr) => Ok(SocketAddr::new(*addr, port)),
        EndpointKind::HostName(host) if host == "localhost" => {
            Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port))
        }
        _ => Err(TransportError::InvalidConfiguration(format!(
            "cannot bind endpoint {}",
            endpoint
        ))),
    }
}

/// Non-loopback addresses of the host's interfaces
fn interface_addresses() -> Result<Vec<IpAddr>> {
    let interfaces = if_addrs::get_if_addrs().map_err(|e| {
        TransportError::InvalidConfiguration(format!("failed to enumerate interfaces: {}", e))
    })?;
    Ok(interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.addr.ip())
        .collect())
}

/// Interface addresses including loopback, for interface-hint matching
pub fn interface_addr_for(name: &str) -> Option<IpAddr> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .find(|iface| iface.name == name)
        .map(|iface| iface.addr.ip())
}
