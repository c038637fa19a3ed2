//! Core error types for Tapestry

use std::time::Duration;
use thiserror::Error;

/// Result type alias using Tapestry's unified error type
pub type Result<T> = std::result::Result<T, TransportError>;

/// Unified error type surfaced by the connection API
///
/// Leaf crates (framing, transport stacks) keep their own error enums and map
/// into this taxonomy at the API boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Candidate racing exhausted without a usable connection
    #[error("Establishment failed: {0}")]
    EstablishmentFailure(String),

    /// DNS/name resolution failed for a host
    #[error("Resolution failed for {host}: {reason}")]
    ResolutionFailure { host: String, reason: String },

    /// Transport-level send failure after the connection was established
    #[error("Send failed: {0}")]
    SendFailure(String),

    /// Transport-level receive failure after the connection was established
    #[error("Receive failed: {0}")]
    ReceiveFailure(String),

    /// Send attempted on a receive-only connection
    #[error("Sending is not allowed on this connection")]
    SendNotAllowed,

    /// Receive attempted on a send-only connection
    #[error("Receiving is not allowed on this connection")]
    ReceiveNotAllowed,

    /// Send attempted after a final message was already accepted
    #[error("A final message was already sent on this connection")]
    SendAfterFinal,

    /// Operation raced with close
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation terminated by abort
    #[error("Connection aborted")]
    Aborted,

    /// Exceeded the connection timeout or a caller-specified deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Request requires a capability no available stack provides
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Preconnection is missing required endpoints or carries contradictory properties
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A framer saw an out-of-range message length
    #[error("Invalid message size: {0} bytes")]
    InvalidMessageSize(usize),

    /// Clone could not produce a new group member
    #[error("Clone failed: {0}")]
    CloneFailed(String),

    /// Internal state machine guard; not expected to escape the crate
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },
}
