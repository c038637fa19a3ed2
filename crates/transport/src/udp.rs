//! UDP stack
//!
//! Unreliable datagram transport preserving message boundaries. Outbound
//! channels are connected sockets; the listener shares one socket and
//! demultiplexes inbound datagrams by source address, materializing an
//! accepted channel the first time a new source is seen. Datagrams may carry
//! data in the first flight, so the stack advertises the zero-RTT capability.

use crate::channel::{Channel, ChannelOption, CloseMode, ServerChannel};
use crate::error::{Result, StackError};
use crate::stack::{ProtocolStack, StackCapabilities};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tapestry_core::endpoint::Endpoint;
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::SecurityParameters;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_DATAGRAM_LEN: usize = 64 * 1024;
const ACCEPT_QUEUE_LEN: usize = 64;
const PEER_QUEUE_LEN: usize = 256;

fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    if remote.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid wildcard")
    } else {
        "[::]:0".parse().expect("valid wildcard")
    }
}

/// Bind with SO_REUSEADDR so a bound-port channel can coexist with a
/// listener on the same port (rendezvous binds both)
fn bind_reusable(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// UDP transport stack
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpStack;

impl UdpStack {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProtocolStack for UdpStack {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn capabilities(&self) -> StackCapabilities {
        StackCapabilities {
            message_boundaries: true,
            multicast: true,
            zero_rtt: true,
            ..Default::default()
        }
    }

    fn can_handle(&self, endpoint: &Endpoint) -> bool {
        endpoint.is_ip_family()
    }

    async fn connect(
        &self,
        remote: SocketAddr,
        _server_name: Option<&str>,
        local: Option<SocketAddr>,
        _properties: &TransportProperties,
        _security: &SecurityParameters,
    ) -> Result<Box<dyn Channel>> {
        let socket = match local {
            Some(local) => bind_reusable(local)?,
            None => UdpSocket::bind(unspecified_for(&remote)).await?,
        };
        socket.connect(remote).await?;
        debug!(%remote, "udp channel connected");
        Ok(Box::new(UdpChannel {
            socket,
            remote,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }))
    }

    async fn listen(
        &self,
        local: SocketAddr,
        _properties: &TransportProperties,
        _security: &SecurityParameters,
    ) -> Result<Box<dyn ServerChannel>> {
        let socket = Arc::new(bind_reusable(local)?);
        debug!(addr = %socket.local_addr()?, "udp listener bound");
        Ok(Box::new(UdpServerChannel::new(socket)))
    }
}

/// Connected-UDP channel (outbound)
struct UdpChannel {
    socket: UdpSocket,
    remote: SocketAddr,
    closed: AtomicBool,
    close_notify: Notify,
}

#[async_trait]
impl Channel for UdpChannel {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StackError::Closed);
        }
        self.socket.send(bytes).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        tokio::select! {
            received = self.socket.recv(&mut buf) => {
                let n = received?;
                buf.truncate(n);
                Ok(Some(buf))
            }
            _ = self.close_notify.notified() => Ok(None),
        }
    }

    async fn close_send(&self) -> Result<()> {
        // Datagrams have no half-close; the final flag travels in the framing.
        Ok(())
    }

    async fn close(&self, _mode: CloseMode) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn set_option(&self, option: ChannelOption) -> Result<()> {
        match option {
            // Nothing coalesces datagrams; the option is trivially satisfied.
            ChannelOption::NoDelay(_) => Ok(()),
            ChannelOption::KeepAlive(_) => Err(StackError::Unsupported(
                "keep-alive on a datagram channel".to_string(),
            )),
        }
    }
}

/// Channel for one remote source sharing the listener's socket
struct UdpPeerChannel {
    socket: Arc<UdpSocket>,
    local_addr: Option<SocketAddr>,
    peer: SocketAddr,
    queue: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

#[async_trait]
impl Channel for UdpPeerChannel {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StackError::Closed);
        }
        self.socket.send_to(bytes, self.peer).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
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
                // Dropping the receiver lets the demux forget this source.
                guard.take();
                Ok(None)
            }
        }
    }

    async fn close_send(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _mode: CloseMode) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
            // A blocked reader drops the receiver itself; otherwise take it
            // here so the source can be forgotten.
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

    async fn set_option(&self, option: ChannelOption) -> Result<()> {
        match option {
            ChannelOption::NoDelay(_) => Ok(()),
            ChannelOption::KeepAlive(_) => Err(StackError::Unsupported(
                "keep-alive on a datagram channel".to_string(),
            )),
        }
    }
}

/// Shared-socket UDP listener demultiplexing by source address
struct UdpServerChannel {
    socket: Arc<UdpSocket>,
    local_addr: Option<SocketAddr>,
    accept_queue: Mutex<mpsc::Receiver<Box<dyn Channel>>>,
    closed: Arc<Notify>,
    demux: JoinHandle<()>,
}

impl UdpServerChannel {
    fn new(socket: Arc<UdpSocket>) -> Self {
        let local_addr = socket.local_addr().ok();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_LEN);
        let closed = Arc::new(Notify::new());
        let demux = tokio::spawn(demux_loop(
            socket.clone(),
            local_addr,
            accept_tx,
            closed.clone(),
        ));
        Self {
            socket,
            local_addr,
            accept_queue: Mutex::new(accept_rx),
            closed,
            demux,
        }
    }
}

async fn demux_loop(
    socket: Arc<UdpSocket>,
    local_addr: Option<SocketAddr>,
    accept_tx: mpsc::Sender<Box<dyn Channel>>,
    closed: Arc<Notify>,
) {
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (n, source) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "udp demux receive failed");
                    break;
                }
            },
            _ = closed.notified() => break,
        };
        let datagram = buf[..n].to_vec();

        // Deliver to a known source, or forget it if its channel went away.
        if let Some(sender) = peers.get(&source) {
            match sender.try_send(datagram.clone()) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    peers.remove(&source);
                }
                // Queue full: the datagram is dropped, as UDP permits.
                Err(mpsc::error::TrySendError::Full(_)) => continue,
            }
        }

        let (peer_tx, peer_rx) = mpsc::channel(PEER_QUEUE_LEN);
        let _ = peer_tx.try_send(datagram);
        let channel: Box<dyn Channel> = Box::new(UdpPeerChannel {
            socket: socket.clone(),
            local_addr,
            peer: source,
            queue: Mutex::new(Some(peer_rx)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        if accept_tx.send(channel).await.is_err() {
            break;
        }
        peers.insert(source, peer_tx);
        debug!(%source, "udp source materialized");
    }
}

#[async_trait]
impl ServerChannel for UdpServerChannel {
    async fn accept(&self) -> Result<Box<dyn Channel>> {
        let mut queue = self.accept_queue.lock().await;
        queue.recv().await.ok_or(StackError::Closed)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.or_else(|| self.socket.local_addr().ok())
    }

    async fn close(&self) -> Result<()> {
        self.closed.notify_waiters();
        Ok(())
    }
}

impl Drop for UdpServerChannel {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> TransportProperties {
        TransportProperties::unreliable_datagram()
    }

    fn security() -> SecurityParameters {
        SecurityParameters::disabled()
    }

    #[tokio::test]
    async fn test_connected_round_trip() {
        let stack = UdpStack::new();
        let server = stack
            .listen("127.0.0.1:0".parse().unwrap(), &props(), &security())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let client = stack
            .connect(addr, None, None, &props(), &security())
            .await
            .unwrap();
        client.write(b"dgram one").await.unwrap();

        let accepted = server.accept().await.unwrap();
        assert_eq!(accepted.read().await.unwrap().unwrap(), b"dgram one");

        // The accepted channel answers over the shared socket.
        accepted.write(b"reply").await.unwrap();
        assert_eq!(client.read().await.unwrap().unwrap(), b"reply");
    }

    #[tokio::test]
    async fn test_demux_one_channel_per_source() {
        let stack = UdpStack::new();
        let server = stack
            .listen("127.0.0.1:0".parse().unwrap(), &props(), &security())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let client_a = stack
            .connect(addr, None, None, &props(), &security())
            .await
            .unwrap();
        let client_b = stack
            .connect(addr, None, None, &props(), &security())
            .await
            .unwrap();

        client_a.write(b"from a").await.unwrap();
        client_a.write(b"again from a").await.unwrap();
        client_b.write(b"from b").await.unwrap();

        let first = server.accept().await.unwrap();
        let second = server.accept().await.unwrap();

        let mut by_source: HashMap<SocketAddr, Box<dyn Channel>> = HashMap::new();
        by_source.insert(first.remote_addr().unwrap(), first);
        by_source.insert(second.remote_addr().unwrap(), second);
        assert_eq!(by_source.len(), 2);

        let from_a = by_source.get(&client_a.local_addr().unwrap()).unwrap();
        assert_eq!(from_a.read().await.unwrap().unwrap(), b"from a");
        assert_eq!(from_a.read().await.unwrap().unwrap(), b"again from a");
    }

    #[tokio::test]
    async fn test_message_boundaries_preserved() {
        let stack = UdpStack::new();
        let server = stack
            .listen("127.0.0.1:0".parse().unwrap(), &props(), &security())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let client = stack
            .connect(addr, None, None, &props(), &security())
            .await
            .unwrap();
        client.write(b"one").await.unwrap();
        client.write(b"two").await.unwrap();

        let accepted = server.accept().await.unwrap();
        assert_eq!(accepted.read().await.unwrap().unwrap(), b"one");
        assert_eq!(accepted.read().await.unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let stack = UdpStack::new();
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client: Arc<Box<dyn Channel>> = Arc::new(
            stack
                .connect(addr, None, None, &props(), &security())
                .await
                .unwrap(),
        );

        let reader = {
            let client = client.clone();
            tokio::spawn(async move { client.read().await })
        };
        tokio::task::yield_now().await;

        client.close(CloseMode::Graceful).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), None);
        assert!(matches!(client.write(b"late").await, Err(StackError::Closed)));
    }

    #[tokio::test]
    async fn test_keepalive_not_supported() {
        let stack = UdpStack::new();
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = stack
            .connect(addr, None, None, &props(), &security())
            .await
            .unwrap();
        assert!(matches!(
            client.set_option(ChannelOption::KeepAlive(true)).await,
            Err(StackError::Unsupported(_))
        ));
        assert!(client.set_option(ChannelOption::NoDelay(true)).await.is_ok());
    }
}
