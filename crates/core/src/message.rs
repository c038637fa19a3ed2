//! Message model
//!
//! Connections exchange discrete messages; each carries a context with the
//! per-message properties framers and the send path act on.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-message properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    /// Safe to send in a replayable first flight (0-RTT)
    pub safely_replayable: bool,
    /// Last message this side will send; the send half closes after it
    pub final_message: bool,
    /// Time after which the message is no longer worth transmitting
    pub lifetime: Option<Duration>,
    /// Advisory priority consulted by group schedulers
    pub priority: Option<i32>,
}

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn safely_replayable(mut self) -> Self {
        self.safely_replayable = true;
        self
    }

    pub fn final_message(mut self) -> Self {
        self.final_message = true;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A discrete application message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub data: Vec<u8>,
    pub context: MessageContext,
}

impl Message {
    /// Message with default context
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            context: MessageContext::default(),
        }
    }

    /// Message with an explicit context
    pub fn with_context(data: impl Into<Vec<u8>>, context: MessageContext) -> Self {
        Self {
            data: data.into(),
            context,
        }
    }

    /// Message flagged as the final one
    pub fn final_message(data: impl Into<Vec<u8>>) -> Self {
        Self::with_context(data, MessageContext::new().final_message())
    }

    pub fn is_final(&self) -> bool {
        self.context.final_message
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::new(data)
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Message::new(data.to_vec())
    }
}
