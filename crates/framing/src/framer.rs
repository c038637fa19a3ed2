//! Framer trait abstraction
//!
//! A framer is a bidirectional codec between application messages and
//! transport bytes. Implementations stay stateless across connections:
//! per-connection parse state (the unconsumed remainder) is owned by the
//! [`FramerChain`](crate::chain::FramerChain), and lifecycle hooks receive
//! the connection handle as a parameter rather than capturing it.

use async_trait::async_trait;
use std::net::SocketAddr;
use tapestry_core::message::Message;
use thiserror::Error;
use uuid::Uuid;

/// Result type for framing operations
pub type Result<T> = std::result::Result<T, FramingError>;

/// Framing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// A frame declared an out-of-range length
    #[error("Invalid message size: {0} bytes")]
    InvalidMessageSize(usize),

    /// Bytes could not be parsed as a frame
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// A lifecycle hook failed
    #[error("Framer hook failed: {0}")]
    Hook(String),
}

/// Connection handle passed to framer lifecycle hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

/// A bidirectional message/byte codec
///
/// Framers compose as an ordered chain; see the crate docs for traversal
/// direction. `parse_inbound` consumes parsed bytes from the front of the
/// buffer and leaves any incomplete frame in place for the next read.
#[async_trait]
pub trait Framer: Send + Sync {
    /// Framer name used in logs
    fn name(&self) -> &'static str;

    /// Encode one message into one or more byte chunks
    fn frame_outbound(&self, message: &Message) -> Result<Vec<Vec<u8>>>;

    /// Decode as many complete messages as the buffer holds
    ///
    /// Consumed bytes are drained from `buf`; the remainder stays for the
    /// next call.
    fn parse_inbound(&self, buf: &mut Vec<u8>) -> Result<Vec<Message>>;

    /// Runs once after the channel is established, before the first inbound
    /// delivery
    async fn connection_did_open(&self, _info: &ConnectionInfo) -> Result<()> {
        Ok(())
    }

    /// Runs when the connection reaches its terminal state
    async fn connection_did_close(&self, _info: &ConnectionInfo) -> Result<()> {
        Ok(())
    }
}
