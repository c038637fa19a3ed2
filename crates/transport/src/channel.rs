//! Transport channel contracts
//!
//! A `Channel` is one established byte- or datagram-level transport
//! conversation; a `ServerChannel` produces channels as peers arrive. Both
//! are object-safe so the connection core can hold them behind trait
//! objects, exactly like the stack trait itself.

use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;

/// How to tear a channel down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Negotiate shutdown with the peer (FIN / close_notify)
    Graceful,
    /// Tear down immediately without negotiation
    Abortive,
}

/// Runtime-settable channel options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOption {
    /// Transport keepalives
    KeepAlive(bool),
    /// Opt out of segment coalescing (TCP_NODELAY)
    NoDelay(bool),
}

/// An established transport conversation
///
/// Implementations must support concurrent `read` and `write` from separate
/// tasks; writes from one task at a time are serialized by the caller.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Write all of `bytes` to the transport
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Read the next chunk; `None` means the peer closed cleanly
    async fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Half-close the send direction; reads continue until the peer closes
    async fn close_send(&self) -> Result<()>;

    /// Close the channel in the given mode; idempotent
    async fn close(&self, mode: CloseMode) -> Result<()>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Apply a runtime option
    ///
    /// # Errors
    /// `StackError::Unsupported` when the transport has no equivalent,
    /// rather than silently degrading.
    async fn set_option(&self, option: ChannelOption) -> Result<()>;
}

/// A bound listening socket producing channels
#[async_trait]
pub trait ServerChannel: Send + Sync {
    /// Wait for the next peer; handshakes (e.g., TLS) complete before return
    async fn accept(&self) -> Result<Box<dyn Channel>>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting and release the socket; idempotent
    async fn close(&self) -> Result<()>;
}
