//! Connection lifecycle events
//!
//! Every connection exposes a broadcast bus carrying the events an
//! application may observe: `ready`, `sent`, `received`, `closed`,
//! `connection_error`, `establishment_error`, and `path_change`. Subscribing
//! is optional; publishing with no subscribers is a no-op, not an error.

use crate::message::{Message, MessageContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event channel capacity per connection
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events observable on a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// Establishment completed; send/receive are now permitted
    Ready {
        connection_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A message finished writing to the transport
    Sent {
        connection_id: Uuid,
        context: MessageContext,
        timestamp: DateTime<Utc>,
    },

    /// A message was delivered to the receive queue
    Received {
        connection_id: Uuid,
        message: Message,
        timestamp: DateTime<Utc>,
    },

    /// The connection reached its terminal state
    Closed {
        connection_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Transport-level failure after establishment
    ConnectionError {
        connection_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Establishment failed before a connection existed
    EstablishmentError {
        connection_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The path under the connection changed
    PathChange {
        connection_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl ConnectionEvent {
    /// Connection the event belongs to
    pub fn connection_id(&self) -> Uuid {
        match self {
            Self::Ready { connection_id, .. }
            | Self::Sent { connection_id, .. }
            | Self::Received { connection_id, .. }
            | Self::Closed { connection_id, .. }
            | Self::ConnectionError { connection_id, .. }
            | Self::EstablishmentError { connection_id, .. }
            | Self::PathChange { connection_id, .. } => *connection_id,
        }
    }

    /// Event timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Ready { timestamp, .. }
            | Self::Sent { timestamp, .. }
            | Self::Received { timestamp, .. }
            | Self::Closed { timestamp, .. }
            | Self::ConnectionError { timestamp, .. }
            | Self::EstablishmentError { timestamp, .. }
            | Self::PathChange { timestamp, .. } => *timestamp,
        }
    }

    /// Event type as a stable string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "connection.ready",
            Self::Sent { .. } => "connection.sent",
            Self::Received { .. } => "connection.received",
            Self::Closed { .. } => "connection.closed",
            Self::ConnectionError { .. } => "connection.error",
            Self::EstablishmentError { .. } => "connection.establishment_error",
            Self::PathChange { .. } => "connection.path_change",
        }
    }
}

/// Broadcast bus for connection events
pub struct EventBus {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    /// Event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    /// Event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    ///
    /// Silently drops the event when nobody is subscribed.
    pub fn publish(&self, event: ConnectionEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
