//! # Tapestry Transport
//!
//! Protocol-stack layer: the polymorphic stack/channel contracts the
//! connection core drives, a registry to plug further stacks in, and the
//! built-in IP stacks (TCP, UDP, TLS over TCP).
//!
//! # Architecture
//!
//! - `ProtocolStack` defines the uniform async `connect`/`listen` API
//! - `Channel`/`ServerChannel` are the byte-level transport contracts
//! - `StackRegistry` is the registration table candidate gathering draws from
//! - Each stack implementation is independent; nothing above this layer
//!   branches on stack identity outside ranking
//!
//! ## Module Structure
//!
//! - `channel`: Channel contracts and close/option types
//! - `stack`: `ProtocolStack` trait and capability set
//! - `registry`: Stack registration table
//! - `tcp`, `udp`, `tls`: Built-in stacks
//! - `logging`: Tracing subscriber helpers for binaries and tests
//! - `error`: Stack-level errors with racer-rankable specificity

pub mod channel;
pub mod error;
pub mod logging;
pub mod registry;
pub mod stack;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use channel::{Channel, ChannelOption, CloseMode, ServerChannel};
pub use error::{Result, StackError};
pub use registry::StackRegistry;
pub use stack::{ProtocolStack, StackCapabilities};
pub use tcp::TcpStack;
pub use tls::TlsTcpStack;
pub use udp::UdpStack;
