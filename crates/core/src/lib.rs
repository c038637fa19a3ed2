//! # Tapestry Core
//!
//! Common types shared across all Tapestry crates: endpoint and transport
//! property models, security parameters, the message model, connection
//! events, configuration, and the unified error taxonomy.
//!
//! ## Module Structure
//!
//! - `endpoint`: Local/remote/multicast endpoint descriptors
//! - `properties`: Preference-valued transport properties
//! - `security`: TLS parameters and verification callbacks
//! - `message`: Message and per-message context
//! - `events`: Connection lifecycle events and the event bus
//! - `config`: TOML/env configuration with documented defaults
//! - `error`: Unified error types

pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod message;
pub mod properties;
pub mod security;

pub use endpoint::{Endpoint, EndpointKind, LocalEndpoint, MulticastEndpoint, RemoteEndpoint, SourceFilter};
pub use error::{Result, TransportError};
pub use message::{Message, MessageContext};
pub use properties::{Direction, MultipathMode, MultipathPolicy, Preference, TransportProperties};
pub use security::{SecurityParameters, SecurityProtocol, TrustVerdict};
