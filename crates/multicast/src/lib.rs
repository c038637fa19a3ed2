//! # Tapestry Multicast
//!
//! Multicast engine over the shared connection core: a sender binds an
//! ephemeral socket and addresses the group, a receiver joins the group
//! (any-source or source-specific) and materializes one virtual connection
//! per unique source, all sharing the underlying socket and one connection
//! group. Unsupported combinations fail with `NotSupported` rather than
//! silently degrading.
//!
//! ## Module Structure
//!
//! - `socket`: socket2-based multicast socket assembly and option plumbing
//! - `sender`: Multicast sender producing a send-capable connection
//! - `receiver`: Group join plus the per-source connection stream

pub mod receiver;
pub mod sender;
mod socket;

pub use receiver::{MulticastListener, MulticastReceiver};
pub use sender::MulticastSender;
