//! # Tapestry Connection
//!
//! The connection core: from a `Preconnection` describing what the
//! application wants, through candidate gathering and racing, to an
//! established `Connection` exchanging framed messages, plus the listener,
//! rendezvous, and connection-group machinery layered on the same parts.
//!
//! # Architecture
//!
//! - `Preconnection` carries endpoints, properties, security, and framers
//! - `resolve` expands endpoints (DNS, interface enumeration)
//! - `gather` crosses stacks x interfaces x remotes into ranked candidates
//! - `racing` runs staggered attempts; the first established channel wins
//! - `Connection` owns the channel, the framer chain, and the state machine
//! - `Listener` accepts peers; `rendezvous` races listen and connect
//! - `ConnectionGroup` is a non-owning registry for bulk lifecycle and
//!   shared properties

pub mod connection;
pub mod gather;
pub mod group;
pub mod listener;
pub mod preconnection;
pub mod racing;
pub mod rendezvous;
pub mod resolve;
pub mod state;

pub use connection::{Connection, ConnectionStats};
pub use gather::Candidate;
pub use group::{ConnectionGroup, GroupScheduler};
pub use listener::{Listener, ListenerStats};
pub use preconnection::Preconnection;
pub use state::ConnectionState;
