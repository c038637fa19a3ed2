//! # Tapestry Framing
//!
//! Converts between the byte stream a transport channel carries and the
//! discrete messages applications exchange. Framers compose as an ordered
//! chain: outbound traverses first-to-last, inbound last-to-first, and the
//! chain preserves unparsed remainders between reads.
//!
//! ## Module Structure
//!
//! - `framer`: The `Framer` trait, hook context, and framing errors
//! - `chain`: The ordered framer chain owning per-connection parse state
//! - `length_prefix`: Built-in length-prefixed framer

pub mod chain;
pub mod framer;
pub mod length_prefix;

pub use chain::FramerChain;
pub use framer::{ConnectionInfo, Framer, FramingError};
pub use length_prefix::LengthPrefixFramer;
