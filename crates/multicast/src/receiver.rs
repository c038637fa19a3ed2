//! Multicast receiver
//!
//! Binds `(any, port)` with reuse-address, joins the group (ASM or
//! source-specific), and materializes a virtual connection the first time a
//! datagram from a new source arrives. Virtual connections share the
//! underlying socket and a single connection group; closing the listener
//! leaves the group and closes all of them. Per-source leave is not exposed:
//! membership ends as a whole when the receiver closes.

use crate::socket;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tapestry_connection::{Connection, ConnectionGroup};
use tapestry_core::endpoint::{MulticastEndpoint, SourceFilter};
use tapestry_core::error::Result;
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::SecurityParameters;
use tapestry_framing::Framer;
use tapestry_transport::{Channel, ChannelOption, CloseMode, StackError};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_DATAGRAM_LEN: usize = 64 * 1024;
const ACCEPT_QUEUE_LEN: usize = 64;
const SOURCE_QUEUE_LEN: usize = 256;

/// Joins a multicast group and yields per-source connections
pub struct MulticastReceiver {
    endpoint: MulticastEndpoint,
    properties: TransportProperties,
    framers: Vec<Arc<dyn Framer>>,
}

impl MulticastReceiver {
    pub fn new(endpoint: MulticastEndpoint) -> Self {
        Self {
            endpoint,
            properties: TransportProperties::unreliable_datagram(),
            framers: Vec::new(),
        }
    }

    pub fn with_properties(mut self, properties: TransportProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn add_framer(mut self, framer: Arc<dyn Framer>) -> Self {
        self.framers.push(framer);
        self
    }

    /// Bind, join the group, and start the per-source stream
    pub async fn join(&self) -> Result<MulticastListener> {
        self.endpoint.validate()?;

        let bind: SocketAddr = if self.endpoint.group.is_ipv4() {
            SocketAddr::new("0.0.0.0".parse().expect("valid wildcard"), self.endpoint.port)
        } else {
            SocketAddr::new("::".parse().expect("valid wildcard"), self.endpoint.port)
        };
        let raw = socket::bind_socket(&self.endpoint, bind)?;
        socket::apply_send_options(&raw, &self.endpoint)?;
        socket::join_group(&raw, &self.endpoint)?;
        let udp = Arc::new(socket::into_tokio(raw)?);

        let group = Arc::new(ConnectionGroup::new(
            self.properties.clone(),
            SecurityParameters::disabled(),
            self.framers.clone(),
        ));

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_LEN);
        let closed = Arc::new(Notify::new());
        let demux = tokio::spawn(demux_loop(
            udp.clone(),
            self.endpoint.clone(),
            self.properties.clone(),
            self.framers.clone(),
            group.clone(),
            accept_tx,
            closed.clone(),
        ));

        debug!(group = %self.endpoint, "multicast receiver joined");
        Ok(MulticastListener {
            socket: udp,
            group,
            accept_queue: Mutex::new(accept_rx),
            closed,
            demux,
            active: AtomicBool::new(true),
        })
    }
}

/// The per-source connection stream of a joined receiver
pub struct MulticastListener {
    socket: Arc<UdpSocket>,
    group: Arc<ConnectionGroup>,
    accept_queue: Mutex<mpsc::Receiver<Connection>>,
    closed: Arc<Notify>,
    demux: JoinHandle<()>,
    active: AtomicBool,
}

impl MulticastListener {
    /// Next newly-seen source's connection; `None` after close
    pub async fn accept(&self) -> Option<Connection> {
        let mut queue = self.accept_queue.lock().await;
        queue.recv().await
    }

    /// The group every virtual connection belongs to
    pub fn group(&self) -> Arc<ConnectionGroup> {
        self.group.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Leave the group and close every virtual connection; idempotent
    pub async fn close(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.closed.notify_waiters();
        self.demux.abort();
        // Dropping the socket (last Arc) leaves the group memberships.
        self.group.close_all().await
    }
}

async fn demux_loop(
    socket: Arc<UdpSocket>,
    endpoint: MulticastEndpoint,
    properties: TransportProperties,
    framers: Vec<Arc<dyn Framer>>,
    group: Arc<ConnectionGroup>,
    accept_tx: mpsc::Sender<Connection>,
    closed: Arc<Notify>,
) {
    let mut sources: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let local_addr = socket.local_addr().ok();

    loop {
        let (n, source) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "multicast receive failed");
                    break;
                }
            },
            _ = closed.notified() => break,
        };

        // The kernel filters SSM joins; keep a userland check as well so a
        // stray membership never surfaces an unexpected source.
        if !source_allowed(&endpoint.filter, source.ip()) {
            continue;
        }
        let datagram = buf[..n].to_vec();

        if let Some(sender) = sources.get(&source) {
            match sender.try_send(datagram.clone()) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    sources.remove(&source);
                }
                // Queue full: drop, as datagram services permit.
                Err(mpsc::error::TrySendError::Full(_)) => continue,
            }
        }

        let (source_tx, source_rx) = mpsc::channel(SOURCE_QUEUE_LEN);
        let _ = source_tx.try_send(datagram);
        let channel = MulticastPeerChannel {
            socket: socket.clone(),
            local_addr,
            peer: source,
            queue: Mutex::new(Some(source_rx)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        };
        let connection =
            Connection::from_channel(Box::new(channel), properties.clone(), framers.clone());
        group.insert(&connection);

        if accept_tx.send(connection).await.is_err() {
            break;
        }
        sources.insert(source, source_tx);
        debug!(%source, "multicast source materialized");
    }
}

fn source_allowed(filter: &SourceFilter, source: IpAddr) -> bool {
    match filter {
        SourceFilter::AnySource => true,
        SourceFilter::SourceSpecific(sources) => sources.contains(&source),
    }
}

/// Virtual connection channel for one multicast source
struct MulticastPeerChannel {
    socket: Arc<UdpSocket>,
    local_addr: Option<SocketAddr>,
    peer: SocketAddr,
    queue: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

#[async_trait]
impl Channel for MulticastPeerChannel {
    async fn write(&self, bytes: &[u8]) -> tapestry_transport::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StackError::Closed);
        }
        // Replies go unicast to the source.
        self.socket.send_to(bytes, self.peer).await?;
        Ok(())
    }

    async fn read(&self) -> tapestry_transport::Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut guard = self.queue.lock().await;
        let Some(receiver) = guard.as_mut() else {
            return Ok(None);
        };
        tokio::select! {
            datagram = receiver.recv() => Ok(datagram),
            _ = self.close_notify.notified() => {
                guard.take();
                Ok(None)
            }
        }
    }

    async fn close_send(&self) -> tapestry_transport::Result<()> {
        Ok(())
    }

    async fn close(&self, _mode: CloseMode) -> tapestry_transport::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
            // A blocked reader drops the receiver itself; otherwise take it
            // here so the demux can forget the source.
            if let Ok(mut guard) = self.queue.try_lock() {
                guard.take();
            }
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn set_option(&self, option: ChannelOption) -> tapestry_transport::Result<()> {
        match option {
            ChannelOption::NoDelay(_) => Ok(()),
            ChannelOption::KeepAlive(_) => Err(StackError::Unsupported(
                "keep-alive on a multicast channel".to_string(),
            )),
        }
    }
}
