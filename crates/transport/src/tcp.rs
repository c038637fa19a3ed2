//! TCP stack
//!
//! Reliable, ordered, congestion-controlled byte stream over IPv4/IPv6.
//! The channel supports concurrent read/write from separate tasks via the
//! socket's readiness API, half-closes the send direction for final
//! messages, and uses SO_LINGER(0) for abortive teardown.

use crate::channel::{Channel, ChannelOption, CloseMode, ServerChannel};
use crate::error::{Result, StackError};
use crate::stack::{ProtocolStack, StackCapabilities};
use async_trait::async_trait;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;
use tapestry_core::endpoint::Endpoint;
use tapestry_core::properties::{Preference, TransportProperties};
use tapestry_core::security::SecurityParameters;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

const READ_BUF_LEN: usize = 64 * 1024;

/// Establish a TCP stream, optionally bound to a local address
///
/// Shared with the TLS stack, which layers its handshake on top.
pub(crate) async fn connect_stream(
    remote: SocketAddr,
    local: Option<SocketAddr>,
) -> Result<TcpStream> {
    let stream = match local {
        Some(local) => {
            let socket = if local.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(local)?;
            socket.connect(remote).await?
        }
        None => TcpStream::connect(remote).await?,
    };
    Ok(stream)
}

/// Apply property-derived socket options to a fresh stream
pub(crate) fn apply_stream_properties(
    stream: &TcpStream,
    properties: &TransportProperties,
) -> Result<()> {
    if matches!(properties.disable_nagle, Preference::Require | Preference::Prefer) {
        stream.set_nodelay(true)?;
    }
    if matches!(properties.keep_alive, Preference::Require | Preference::Prefer) {
        let sock = socket2::SockRef::from(stream);
        sock.set_keepalive(true)?;
    }
    Ok(())
}

/// TCP transport stack
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpStack;

impl TcpStack {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProtocolStack for TcpStack {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn capabilities(&self) -> StackCapabilities {
        StackCapabilities {
            reliability: true,
            ordering: true,
            congestion_control: true,
            keep_alive: true,
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
        properties: &TransportProperties,
        _security: &SecurityParameters,
    ) -> Result<Box<dyn Channel>> {
        let stream = connect_stream(remote, local).await?;
        apply_stream_properties(&stream, properties)?;
        debug!(%remote, "tcp connection established");
        Ok(Box::new(TcpChannel::new(stream)))
    }

    async fn listen(
        &self,
        local: SocketAddr,
        properties: &TransportProperties,
        _security: &SecurityParameters,
    ) -> Result<Box<dyn ServerChannel>> {
        let listener = TcpListener::bind(local).await?;
        debug!(addr = %listener.local_addr()?, "tcp listener bound");
        Ok(Box::new(TcpServerChannel::new(listener, properties.clone())))
    }
}

/// One established TCP conversation
pub struct TcpChannel {
    stream: TcpStream,
    /// Serializes writers so chunks from different tasks never interleave
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StackError::Closed);
        }
        let _guard = self.write_lock.lock().await;
        let mut written = 0;
        while written < bytes.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(StackError::from_io(&e)),
            }
        }
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; READ_BUF_LEN];
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            self.stream.readable().await?;
            match self.stream.try_read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(StackError::from_io(&e)),
            }
        }
    }

    async fn close_send(&self) -> Result<()> {
        let sock = socket2::SockRef::from(&self.stream);
        sock.shutdown(Shutdown::Write)
            .or_else(ignore_not_connected)?;
        Ok(())
    }

    async fn close(&self, mode: CloseMode) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sock = socket2::SockRef::from(&self.stream);
        match mode {
            CloseMode::Graceful => {
                sock.shutdown(Shutdown::Write).or_else(ignore_not_connected)?;
            }
            CloseMode::Abortive => {
                let _ = sock.set_linger(Some(Duration::ZERO));
                sock.shutdown(Shutdown::Both).or_else(ignore_not_connected)?;
            }
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    async fn set_option(&self, option: ChannelOption) -> Result<()> {
        match option {
            ChannelOption::NoDelay(enabled) => {
                self.stream.set_nodelay(enabled)?;
            }
            ChannelOption::KeepAlive(enabled) => {
                let sock = socket2::SockRef::from(&self.stream);
                sock.set_keepalive(enabled)?;
            }
        }
        Ok(())
    }
}

fn ignore_not_connected(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == std::io::ErrorKind::NotConnected {
        Ok(())
    } else {
        Err(e)
    }
}

/// Listening TCP socket yielding accepted channels
pub struct TcpServerChannel {
    listener: StdMutex<Option<Arc<TcpListener>>>,
    local_addr: Option<SocketAddr>,
    properties: TransportProperties,
    closed: Notify,
}

impl TcpServerChannel {
    pub fn new(listener: TcpListener, properties: TransportProperties) -> Self {
        let local_addr = listener.local_addr().ok();
        Self {
            listener: StdMutex::new(Some(Arc::new(listener))),
            local_addr,
            properties,
            closed: Notify::new(),
        }
    }

    fn listener(&self) -> Result<Arc<TcpListener>> {
        self.listener
            .lock()
            .expect("listener lock poisoned")
            .clone()
            .ok_or(StackError::Closed)
    }
}

#[async_trait]
impl ServerChannel for TcpServerChannel {
    async fn accept(&self) -> Result<Box<dyn Channel>> {
        let listener = self.listener()?;
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = accepted.map_err(|e| StackError::from_io(&e))?;
                apply_stream_properties(&stream, &self.properties)?;
                debug!(%remote, "tcp connection accepted");
                Ok(Box::new(TcpChannel::new(stream)) as Box<dyn Channel>)
            }
            _ = self.closed.notified() => Err(StackError::Closed),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn close(&self) -> Result<()> {
        self.listener.lock().expect("listener lock poisoned").take();
        self.closed.notify_waiters();
        Ok(())
    }
}
