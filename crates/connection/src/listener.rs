//! Listener
//!
//! Binds every local endpoint of a preconnection (the first bind failure is
//! fatal to the whole call), runs one accept loop per bound server channel,
//! wires accepted channels through the framer chain, and yields established
//! connections as a lazy, finite stream. An optional connection limit closes
//! over-limit channels immediately; `stop` cancels in-flight handshakes and
//! finishes the stream.

use crate::connection::{Connection, EstablishmentOrigin};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tapestry_core::config::TapestryConfig;
use tapestry_core::endpoint::{Endpoint, LocalEndpoint};
use tapestry_core::error::{Result, TransportError};
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::SecurityParameters;
use tapestry_framing::Framer;
use tapestry_transport::{CloseMode, ProtocolStack, ServerChannel, StackError, StackRegistry};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Cumulative listener counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Connections accepted and yielded
    pub accepted: u64,
    /// Channels closed because the connection limit was reached
    pub rejected: u64,
}

struct ListenerInner {
    id: Uuid,
    accept_queue: Mutex<mpsc::Receiver<Connection>>,
    servers: StdMutex<Vec<Arc<dyn ServerChannel>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    active: AtomicBool,
    accepted: AtomicU64,
    rejected: AtomicU64,
    local_addrs: Vec<SocketAddr>,
}

/// A bound listener yielding accepted connections
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

/// Bind and start accepting; used by `Preconnection::listen` and rendezvous
pub(crate) async fn start(
    registry: Arc<StackRegistry>,
    locals: &[LocalEndpoint],
    properties: TransportProperties,
    security: SecurityParameters,
    framers: Vec<Arc<dyn Framer>>,
    config: &TapestryConfig,
) -> Result<Listener> {
    if locals.is_empty() {
        return Err(TransportError::InvalidConfiguration(
            "listen requires at least one local endpoint".to_string(),
        ));
    }

    let mut servers: Vec<Arc<dyn ServerChannel>> = Vec::new();
    let mut local_addrs = Vec::new();

    for endpoint in locals {
        let stack = select_listen_stack(&registry, endpoint, &properties, &security)?;
        let bind = crate::resolve::bind_addr(endpoint)?;
        match stack.listen(bind, &properties, &security).await {
            Ok(server) => {
                if let Some(addr) = server.local_addr() {
                    local_addrs.push(addr);
                }
                debug!(stack = stack.name(), %bind, "listener bound");
                servers.push(Arc::from(server));
            }
            Err(e) => {
                // One failed endpoint is fatal; release what was bound.
                for server in &servers {
                    let _ = server.close().await;
                }
                return Err(TransportError::EstablishmentFailure(format!(
                    "failed to bind {}: {}",
                    bind, e
                )));
            }
        }
    }

    let (accept_tx, accept_rx) = mpsc::channel(config.listener.accept_backlog);
    let limit = config.listener.connection_limit;

    let inner = Arc::new(ListenerInner {
        id: Uuid::now_v7(),
        accept_queue: Mutex::new(accept_rx),
        servers: StdMutex::new(servers.clone()),
        tasks: StdMutex::new(Vec::new()),
        active: AtomicBool::new(true),
        accepted: AtomicU64::new(0),
        rejected: AtomicU64::new(0),
        local_addrs,
    });

    let mut tasks = Vec::new();
    for server in servers {
        tasks.push(tokio::spawn(accept_loop(
            inner.clone(),
            server,
            accept_tx.clone(),
            registry.clone(),
            properties.clone(),
            security.clone(),
            framers.clone(),
            config.clone(),
            limit,
        )));
    }
    *inner.tasks.lock().expect("tasks lock poisoned") = tasks;

    Ok(Listener { inner })
}

fn select_listen_stack(
    registry: &StackRegistry,
    endpoint: &Endpoint,
    properties: &TransportProperties,
    security: &SecurityParameters,
) -> Result<Arc<dyn ProtocolStack>> {
    registry
        .stacks()
        .iter()
        .filter(|stack| {
            let caps = stack.capabilities();
            stack.can_handle(endpoint)
                && caps.satisfies(properties)
                && caps.security == security.is_enabled()
        })
        .max_by_key(|stack| stack.priority(properties))
        .cloned()
        .ok_or_else(|| {
            TransportError::NotSupported(format!("no stack can listen on {}", endpoint))
        })
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    inner: Arc<ListenerInner>,
    server: Arc<dyn ServerChannel>,
    accept_tx: mpsc::Sender<Connection>,
    registry: Arc<StackRegistry>,
    properties: TransportProperties,
    security: SecurityParameters,
    framers: Vec<Arc<dyn Framer>>,
    config: TapestryConfig,
    limit: Option<usize>,
) {
    loop {
        match server.accept().await {
            Ok(channel) => {
                if let Some(limit) = limit {
                    if inner.accepted.load(Ordering::Acquire) >= limit as u64 {
                        inner.rejected.fetch_add(1, Ordering::Relaxed);
                        debug!(listener = %inner.id, "connection limit reached; closing channel");
                        let _ = channel.close(CloseMode::Abortive).await;
                        continue;
                    }
                }

                // Accepted connections can clone toward their peer.
                let origin = channel.remote_addr().map(|addr| EstablishmentOrigin {
                    registry: registry.clone(),
                    remote: Endpoint::ip(addr.ip()).with_port(addr.port()),
                    security: security.clone(),
                    framers: framers.clone(),
                    config: config.clone(),
                });

                let connection =
                    Connection::establish(channel, properties.clone(), framers.clone(), origin);
                inner.accepted.fetch_add(1, Ordering::AcqRel);

                if accept_tx.send(connection.clone()).await.is_err() {
                    // Listener gone before the connection was consumed.
                    let _ = connection.abort().await;
                    return;
                }
            }
            Err(StackError::AuthenticationFailed(reason)) => {
                // A failed handshake is a per-peer problem; keep listening.
                warn!(listener = %inner.id, %reason, "handshake failed on accept");
            }
            Err(StackError::Closed) => return,
            Err(e) => {
                warn!(listener = %inner.id, error = %e, "accept failed; stopping loop");
                return;
            }
        }
    }
}

impl Listener {
    /// Next accepted connection; `None` once the listener has stopped and
    /// the stream is drained
    pub async fn accept(&self) -> Option<Connection> {
        let mut queue = self.inner.accept_queue.lock().await;
        queue.recv().await
    }

    /// Addresses actually bound (ephemeral ports resolved)
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.inner.local_addrs
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            accepted: self.inner.accepted.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting: cancels in-flight handshakes, closes the bound
    /// sockets, and finishes the accepted-connection stream; idempotent
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(listener = %self.inner.id, "stopping listener");

        let servers = std::mem::take(&mut *self.inner.servers.lock().expect("servers lock poisoned"));
        for server in servers {
            let _ = server.close().await;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().expect("tasks lock poisoned"));
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.inner.id)
            .field("local_addrs", &self.inner.local_addrs)
            .field("active", &self.is_active())
            .finish()
    }
}
