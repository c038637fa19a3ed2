//! Stack-level errors
//!
//! The variants are deliberately finer-grained than the connection API's
//! taxonomy: the racing engine ranks per-attempt failures by specificity
//! (authentication > refused > timeout > unreachable > other) and reports
//! the most specific one when every attempt failed.

use std::time::Duration;
use thiserror::Error;

/// Result type for stack operations
pub type Result<T> = std::result::Result<T, StackError>;

/// Errors produced by protocol stacks and channels
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StackError {
    /// TLS or peer-verification failure
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The peer actively refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The attempt exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// No route to the host or network
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// The stack cannot satisfy the request
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// The channel is closed
    #[error("Channel closed")]
    Closed,

    /// Any other I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl StackError {
    /// Map an I/O error onto the taxonomy
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused(error.to_string()),
            ErrorKind::TimedOut => Self::Timeout(Duration::ZERO),
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                Self::Unreachable(error.to_string())
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::Closed
            }
            _ => Self::Io(error.to_string()),
        }
    }

    /// Rank for most-specific-failure selection; higher is more specific
    pub fn specificity(&self) -> u8 {
        match self {
            Self::AuthenticationFailed(_) => 4,
            Self::ConnectionRefused(_) => 3,
            Self::Timeout(_) => 2,
            Self::Unreachable(_) => 1,
            Self::Unsupported(_) | Self::Closed | Self::Io(_) => 0,
        }
    }
}

impl From<std::io::Error> for StackError {
    fn from(error: std::io::Error) -> Self {
        Self::from_io(&error)
    }
}
