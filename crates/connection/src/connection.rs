//! Connection core
//!
//! A `Connection` owns its transport channel, its framer chain, and its
//! state machine. One reader task per connection feeds inbound bytes through
//! the chain into a buffered receive queue; sends are serialized through a
//! fair lock so submission order is delivery order. Close is graceful and
//! idempotent; abort is immediate; both resolve every pending operation.
//!
//! # Thread Safety
//! - The handle is cheaply cloneable; all state lives behind the inner Arc
//! - Short-lived std mutexes guard state and registration; async locks guard
//!   the framer chain, the send path, and the receive queue

use crate::group::ConnectionGroup;
use crate::state::{ConnectionState, StateMachine};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tapestry_core::config::TapestryConfig;
use tapestry_core::endpoint::RemoteEndpoint;
use tapestry_core::error::{Result, TransportError};
use tapestry_core::events::{ConnectionEvent, EventBus};
use tapestry_core::message::Message;
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::SecurityParameters;
use tapestry_framing::{ConnectionInfo, Framer, FramerChain, FramingError};
use tapestry_transport::{Channel, ChannelOption, CloseMode, StackError, StackRegistry};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything needed to re-establish toward the same remote (cloning)
#[derive(Clone)]
pub(crate) struct EstablishmentOrigin {
    pub registry: Arc<StackRegistry>,
    pub remote: RemoteEndpoint,
    pub security: SecurityParameters,
    pub framers: Vec<Arc<dyn Framer>>,
    pub config: TapestryConfig,
}

/// Cumulative per-connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

pub(crate) struct ConnectionInner {
    id: Uuid,
    properties: TransportProperties,
    state: StdMutex<StateMachine>,
    channel: Arc<dyn Channel>,
    chain: Mutex<FramerChain>,
    /// Fair queue: submission order is delivery order
    send_lock: Mutex<()>,
    final_sent: AtomicBool,
    aborted: AtomicBool,
    shutdown_done: AtomicBool,
    recv_queue: Mutex<mpsc::UnboundedReceiver<Result<Message>>>,
    events: EventBus,
    group: StdMutex<Option<Arc<ConnectionGroup>>>,
    cloned_independent: AtomicBool,
    origin: StdMutex<Option<EstablishmentOrigin>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// An established message-oriented connection
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap an already-established channel (stack providers, multicast)
    pub fn from_channel(
        channel: Box<dyn Channel>,
        properties: TransportProperties,
        framers: Vec<Arc<dyn Framer>>,
    ) -> Self {
        Self::establish(channel, properties, framers, None)
    }

    pub(crate) fn establish(
        channel: Box<dyn Channel>,
        properties: TransportProperties,
        framers: Vec<Arc<dyn Framer>>,
        origin: Option<EstablishmentOrigin>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            id: Uuid::now_v7(),
            properties,
            state: StdMutex::new(StateMachine::new()),
            channel: Arc::from(channel),
            chain: Mutex::new(FramerChain::new(framers)),
            send_lock: Mutex::new(()),
            final_sent: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            shutdown_done: AtomicBool::new(false),
            recv_queue: Mutex::new(queue_rx),
            events: EventBus::new(),
            group: StdMutex::new(None),
            cloned_independent: AtomicBool::new(false),
            origin: StdMutex::new(origin),
            reader: StdMutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        });

        inner.lock_state(|sm| sm.transition(ConnectionState::Established).map(|_| ()))
            .expect("fresh machine reaches established");
        inner.events.publish(ConnectionEvent::Ready {
            connection_id: inner.id,
            timestamp: Utc::now(),
        });
        debug!(id = %inner.id, remote = ?inner.channel.remote_addr(), "connection ready");

        let reader = tokio::spawn(reader_loop(inner.clone(), queue_tx));
        *inner.reader.lock().expect("reader lock poisoned") = Some(reader);

        Self { inner }
    }

    /// Connection identity
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state_read()
    }

    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    pub fn properties(&self) -> &TransportProperties {
        &self.inner.properties
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.channel.local_addr()
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.channel.remote_addr()
    }

    /// True when this connection was produced by a clone that fell back to
    /// an independent transport connection (nothing is aliased with the
    /// original: own local port, own security session)
    pub fn cloned_as_independent(&self) -> bool {
        self.inner.cloned_independent.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Subscribe to this connection's lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The group this connection belongs to, if any
    pub fn group(&self) -> Option<Arc<ConnectionGroup>> {
        self.inner.group.lock().expect("group lock poisoned").clone()
    }

    /// Send one message
    ///
    /// Sends on one connection deliver in submission order. A `final`
    /// message half-closes the send direction once it is on the wire.
    ///
    /// # Errors
    /// - `SendNotAllowed` on a receive-only connection
    /// - `SendAfterFinal` once a final message was accepted
    /// - `ConnectionClosed` when racing with close
    /// - `SendFailure` / `InvalidMessageSize` on transport or framing failure
    pub async fn send(&self, message: Message) -> Result<()> {
        if !self.inner.properties.can_send() {
            return Err(TransportError::SendNotAllowed);
        }
        self.inner.ensure_established()?;
        if self.inner.final_sent.load(Ordering::Acquire) {
            return Err(TransportError::SendAfterFinal);
        }

        let submitted = Instant::now();
        let _guard = self.inner.send_lock.lock().await;

        // Re-check under the lock: close or a final send may have raced in.
        self.inner.ensure_established()?;
        if self.inner.final_sent.load(Ordering::Acquire) {
            return Err(TransportError::SendAfterFinal);
        }
        if let Some(lifetime) = message.context.lifetime {
            if submitted.elapsed() >= lifetime {
                return Err(TransportError::SendFailure(
                    "message lifetime expired before transmission".to_string(),
                ));
            }
        }

        let chunks = self
            .inner
            .chain
            .lock()
            .await
            .outbound(&message)
            .map_err(|e| match e {
                FramingError::InvalidMessageSize(n) => TransportError::InvalidMessageSize(n),
                other => TransportError::SendFailure(other.to_string()),
            })?;

        // The message is accepted from here on; later sends see the flag.
        if message.is_final() {
            self.inner.final_sent.store(true, Ordering::Release);
        }

        for chunk in &chunks {
            if let Err(e) = self.inner.channel.write(chunk).await {
                return Err(self.inner.fail(e).await);
            }
            self.inner.bytes_sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);

        if message.is_final() {
            let _ = self.inner.channel.close_send().await;
            debug!(id = %self.inner.id, "send direction half-closed after final message");
        }

        self.inner.events.publish(ConnectionEvent::Sent {
            connection_id: self.inner.id,
            context: message.context,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Receive the next message
    ///
    /// Returns a buffered message when one is available, otherwise suspends
    /// until a message arrives, the connection closes, or the caller
    /// cancels. Cancelling loses nothing.
    ///
    /// # Errors
    /// - `ReceiveNotAllowed` on a send-only connection
    /// - `ConnectionClosed` / `Aborted` when the connection ended
    /// - `ReceiveFailure` on transport or framing failure
    pub async fn receive(&self) -> Result<Message> {
        if !self.inner.properties.can_receive() {
            return Err(TransportError::ReceiveNotAllowed);
        }
        let mut queue = self.inner.recv_queue.lock().await;
        match queue.recv().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(e),
            None => Err(self.inner.terminal_error()),
        }
    }

    /// Gracefully close the connection; idempotent
    ///
    /// Queued sends complete first; no new sends are accepted; outstanding
    /// receives resolve with `ConnectionClosed`.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            match state.state() {
                ConnectionState::Closed | ConnectionState::Closing => return Ok(()),
                _ => {
                    let _ = state.transition(ConnectionState::Closing);
                }
            }
        }
        debug!(id = %self.inner.id, "closing connection");

        // Wait for in-flight sends, then shut the transport down.
        drop(self.inner.send_lock.lock().await);
        let _ = self.inner.channel.close(CloseMode::Graceful).await;

        self.inner.stop_reader();
        self.inner.finish_shutdown().await;
        Ok(())
    }

    /// Abort the connection immediately; idempotent
    ///
    /// Pending operations terminate with `Aborted`.
    pub async fn abort(&self) -> Result<()> {
        self.inner.aborted.store(true, Ordering::Release);
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            if state.state() == ConnectionState::Closed {
                return Ok(());
            }
            let _ = state.transition(ConnectionState::Closed);
        }
        debug!(id = %self.inner.id, "aborting connection");

        let _ = self.inner.channel.close(CloseMode::Abortive).await;
        self.inner.stop_reader();
        self.inner.finish_shutdown().await;
        Ok(())
    }

    /// Clone this connection into its group
    ///
    /// Lazily forms a group, establishes a new connection to the same remote
    /// with merged properties, and adds it to the group. None of the built-in
    /// stacks multistreams, so the clone falls back to an independent
    /// transport connection — which counts as a successful clone and is
    /// flagged via [`Connection::cloned_as_independent`].
    ///
    /// # Errors
    /// `CloneFailed` when no establishment context exists or establishment
    /// toward the original remote fails.
    pub async fn clone_connection(
        &self,
        alterations: Option<TransportProperties>,
        framer: Option<Arc<dyn Framer>>,
    ) -> Result<Connection> {
        let origin = self
            .inner
            .origin
            .lock()
            .expect("origin lock poisoned")
            .clone()
            .ok_or_else(|| {
                TransportError::CloneFailed("connection has no establishment context".to_string())
            })?;

        let group = self.ensure_group();
        let properties = alterations.unwrap_or_else(|| self.inner.properties.clone());
        let mut framers = origin.framers.clone();
        if let Some(framer) = framer {
            framers.push(framer);
        }

        let clone = crate::preconnection::establish(
            &origin.registry,
            &[],
            std::slice::from_ref(&origin.remote),
            &properties,
            &origin.security,
            framers,
            &origin.config,
        )
        .await
        .map_err(|e| TransportError::CloneFailed(e.to_string()))?;

        clone.inner.cloned_independent.store(true, Ordering::Release);
        clone.set_group(group.clone());
        group.insert(&clone);
        debug!(original = %self.inner.id, clone = %clone.inner.id, "connection cloned into group");
        Ok(clone)
    }

    /// Close every member of this connection's group (or just this
    /// connection when no group exists)
    pub async fn close_group(&self) -> Result<()> {
        match self.group() {
            Some(group) => group.close_all().await,
            None => self.close().await,
        }
    }

    /// Abort every member of this connection's group (or just this
    /// connection when no group exists)
    pub async fn abort_group(&self) -> Result<()> {
        match self.group() {
            Some(group) => group.abort_all().await,
            None => self.abort().await,
        }
    }

    /// Toggle transport keepalives at runtime
    pub async fn set_keep_alive(&self, enabled: bool) -> Result<()> {
        self.inner.set_option(ChannelOption::KeepAlive(enabled)).await
    }

    /// Toggle segment coalescing at runtime
    pub async fn set_no_delay(&self, enabled: bool) -> Result<()> {
        self.inner.set_option(ChannelOption::NoDelay(enabled)).await
    }

    /// The group, creating (and joining) one if none exists yet
    pub fn ensure_group(&self) -> Arc<ConnectionGroup> {
        let created = {
            let mut guard = self.inner.group.lock().expect("group lock poisoned");
            if let Some(group) = guard.as_ref() {
                return group.clone();
            }
            let security = self
                .inner
                .origin
                .lock()
                .expect("origin lock poisoned")
                .as_ref()
                .map(|o| o.security.clone())
                .unwrap_or_else(SecurityParameters::disabled);
            let framers = self
                .inner
                .origin
                .lock()
                .expect("origin lock poisoned")
                .as_ref()
                .map(|o| o.framers.clone())
                .unwrap_or_default();
            let group = Arc::new(ConnectionGroup::new(
                self.inner.properties.clone(),
                security,
                framers,
            ));
            guard.replace(group.clone());
            group
        };
        created.insert(self);
        created
    }

    pub(crate) fn set_group(&self, group: Arc<ConnectionGroup>) {
        self.inner
            .group
            .lock()
            .expect("group lock poisoned")
            .replace(group);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.inner.lock_state_read())
            .field("remote", &self.inner.channel.remote_addr())
            .finish()
    }
}

impl ConnectionInner {
    fn lock_state<T>(&self, f: impl FnOnce(&mut StateMachine) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock().expect("state lock poisoned");
        f(&mut guard)
    }

    fn lock_state_read(&self) -> ConnectionState {
        self.state.lock().expect("state lock poisoned").state()
    }

    fn ensure_established(&self) -> Result<()> {
        match self.lock_state_read() {
            ConnectionState::Established => Ok(()),
            ConnectionState::Establishing => Err(TransportError::EstablishmentFailure(
                "connection is not ready".to_string(),
            )),
            _ => Err(self.terminal_error()),
        }
    }

    fn terminal_error(&self) -> TransportError {
        if self.aborted.load(Ordering::Acquire) {
            TransportError::Aborted
        } else {
            TransportError::ConnectionClosed
        }
    }

    fn framer_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id,
            local_addr: self.channel.local_addr(),
            remote_addr: self.channel.remote_addr(),
        }
    }

    fn stop_reader(&self) {
        if let Some(handle) = self.reader.lock().expect("reader lock poisoned").take() {
            handle.abort();
        }
    }

    async fn set_option(&self, option: ChannelOption) -> Result<()> {
        self.channel.set_option(option).await.map_err(|e| match e {
            StackError::Unsupported(reason) => TransportError::NotSupported(reason),
            other => TransportError::SendFailure(other.to_string()),
        })
    }

    /// Post-`established` I/O failure: closes the connection and reports the
    /// mapped error
    async fn fail(&self, error: StackError) -> TransportError {
        if self.aborted.load(Ordering::Acquire) {
            return TransportError::Aborted;
        }
        let mapped = TransportError::SendFailure(error.to_string());
        self.events.publish(ConnectionEvent::ConnectionError {
            connection_id: self.id,
            reason: error.to_string(),
            timestamp: Utc::now(),
        });
        let _ = self.channel.close(CloseMode::Abortive).await;
        self.stop_reader();
        self.finish_shutdown().await;
        mapped
    }

    /// One-shot terminal bookkeeping: state, close hooks, event, group
    async fn finish_shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if state.state() != ConnectionState::Closed {
                let _ = state.transition(ConnectionState::Closed);
            }
        }
        let info = self.framer_info();
        self.chain.lock().await.connection_did_close(&info).await;
        self.events.publish(ConnectionEvent::Closed {
            connection_id: self.id,
            timestamp: Utc::now(),
        });
        if let Some(group) = self.group.lock().expect("group lock poisoned").take() {
            group.remove(self.id);
        }
        debug!(id = %self.id, "connection closed");
    }
}

async fn reader_loop(inner: Arc<ConnectionInner>, queue: mpsc::UnboundedSender<Result<Message>>) {
    let info = inner.framer_info();
    inner.chain.lock().await.connection_did_open(&info).await;

    loop {
        match inner.channel.read().await {
            Ok(Some(bytes)) => {
                inner.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                let parsed = inner.chain.lock().await.inbound(&bytes);
                match parsed {
                    Ok(messages) => {
                        for message in messages {
                            inner.messages_received.fetch_add(1, Ordering::Relaxed);
                            inner.events.publish(ConnectionEvent::Received {
                                connection_id: inner.id,
                                message: message.clone(),
                                timestamp: Utc::now(),
                            });
                            // No receivers is fine; the queue is the buffer.
                            let _ = queue.send(Ok(message));
                        }
                    }
                    Err(e) => {
                        warn!(id = %inner.id, error = %e, "inbound framing failed; closing channel");
                        let _ = queue.send(Err(TransportError::ReceiveFailure(e.to_string())));
                        inner.events.publish(ConnectionEvent::ConnectionError {
                            connection_id: inner.id,
                            reason: e.to_string(),
                            timestamp: Utc::now(),
                        });
                        let _ = inner.channel.close(CloseMode::Abortive).await;
                        inner.finish_shutdown().await;
                        return;
                    }
                }
            }
            Ok(None) | Err(StackError::Closed) => {
                // Clean close or peer reset; either way the peer is gone.
                debug!(id = %inner.id, "peer closed the channel");
                inner.finish_shutdown().await;
                return;
            }
            Err(e) => {
                let closing = matches!(
                    inner.lock_state_read(),
                    ConnectionState::Closing | ConnectionState::Closed
                );
                if !closing {
                    let _ = queue.send(Err(TransportError::ReceiveFailure(e.to_string())));
                    inner.events.publish(ConnectionEvent::ConnectionError {
                        connection_id: inner.id,
                        reason: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
                inner.finish_shutdown().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestry_core::properties::Direction;
    use tapestry_transport::{ProtocolStack, TcpStack};

    async fn tcp_pair(
        client_props: TransportProperties,
        server_props: TransportProperties,
    ) -> (Connection, Connection) {
        let stack = TcpStack::new();
        let security = SecurityParameters::disabled();
        let props = TransportProperties::default();

        let server = stack
            .listen("127.0.0.1:0".parse().unwrap(), &props, &security)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (client_channel, accepted) = tokio::join!(
            stack.connect(addr, None, None, &props, &security),
            server.accept(),
        );
        let client = Connection::from_channel(client_channel.unwrap(), client_props, vec![]);
        let server = Connection::from_channel(accepted.unwrap(), server_props, vec![]);
        (client, server)
    }

    async fn default_pair() -> (Connection, Connection) {
        tcp_pair(TransportProperties::default(), TransportProperties::default()).await
    }

    #[tokio::test]
    async fn test_send_receive_round_trip() {
        let (client, server) = default_pair().await;
        assert!(client.is_established());

        client.send(Message::new(b"ping".as_slice())).await.unwrap();
        let received = server.receive().await.unwrap();
        assert_eq!(received.data, b"ping");

        let stats = client.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_send_after_final_fails() {
        let (client, server) = default_pair().await;

        client.send(Message::final_message(b"bye".as_slice())).await.unwrap();
        let result = client.send(Message::new(b"x".as_slice())).await;
        assert_eq!(result, Err(TransportError::SendAfterFinal));

        // Peer still reads the final payload, then sees the close.
        assert_eq!(server.receive().await.unwrap().data, b"bye");
        assert_eq!(server.receive().await, Err(TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_direction_recv_only_rejects_send() {
        let mut props = TransportProperties::default();
        props.direction = Direction::RecvOnly;
        let (client, _server) = tcp_pair(props, TransportProperties::default()).await;

        let result = client.send(Message::new(b"nope".as_slice())).await;
        assert_eq!(result, Err(TransportError::SendNotAllowed));
    }

    #[tokio::test]
    async fn test_direction_send_only_rejects_receive() {
        let mut props = TransportProperties::default();
        props.direction = Direction::SendOnly;
        let (client, _server) = tcp_pair(props, TransportProperties::default()).await;

        assert_eq!(client.receive().await, Err(TransportError::ReceiveNotAllowed));
    }

    #[tokio::test]
    async fn test_close_resolves_pending_receive() {
        let (client, server) = default_pair().await;

        let pending = {
            let server = server.clone();
            tokio::spawn(async move { server.receive().await })
        };
        tokio::task::yield_now().await;

        server.close().await.unwrap();
        assert_eq!(pending.await.unwrap(), Err(TransportError::ConnectionClosed));
        assert_eq!(server.state(), ConnectionState::Closed);
        drop(client);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_new_sends() {
        let (client, _server) = default_pair().await;

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);

        let result = client.send(Message::new(b"late".as_slice())).await;
        assert_eq!(result, Err(TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_abort_resolves_with_aborted() {
        let (client, _server) = default_pair().await;

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.receive().await })
        };
        tokio::task::yield_now().await;

        client.abort().await.unwrap();
        assert_eq!(pending.await.unwrap(), Err(TransportError::Aborted));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_connection_closed() {
        let (client, server) = default_pair().await;

        client.close().await.unwrap();
        assert_eq!(server.receive().await, Err(TransportError::ConnectionClosed));
        // The reader observed the peer close and finished the state machine.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_submission_order_is_delivery_order() {
        let (client, server) = default_pair().await;

        for i in 0..10u8 {
            client.send(Message::new(vec![i])).await.unwrap();
        }
        // TCP may coalesce the writes into one segment; the empty framer
        // chain then yields one message per read, so collect bytes instead.
        let mut received = Vec::new();
        while received.len() < 10 {
            received.extend(server.receive().await.unwrap().data);
        }
        assert_eq!(received, (0..10u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_ready_and_closed_events() {
        let stack = TcpStack::new();
        let security = SecurityParameters::disabled();
        let props = TransportProperties::default();

        let server = stack
            .listen("127.0.0.1:0".parse().unwrap(), &props, &security)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (client_channel, _accepted) = tokio::join!(
            stack.connect(addr, None, None, &props, &security),
            server.accept(),
        );
        let client =
            Connection::from_channel(client_channel.unwrap(), props.clone(), vec![]);

        // Ready was published before subscription; watch the close instead.
        let mut events = client.events();
        client.close().await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), "connection.closed");
        assert_eq!(event.connection_id(), client.id());
    }

    #[tokio::test]
    async fn test_expired_lifetime_fails_send() {
        let (client, _server) = default_pair().await;
        let message = Message::with_context(
            b"stale".as_slice(),
            tapestry_core::message::MessageContext::new()
                .with_lifetime(std::time::Duration::ZERO),
        );
        // A zero lifetime has always expired by the time the lock is held.
        let result = client.send(message).await;
        assert!(matches!(result, Err(TransportError::SendFailure(_))));
    }
}
