//! Multicast sender
//!
//! Binds an ephemeral socket, applies TTL/loopback/interface options, and
//! produces a connection whose sends are addressed to the group. Reads on a
//! sender connection only ever see looped-back datagrams, so most senders
//! run with a send-only direction.

use crate::socket;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tapestry_connection::Connection;
use tapestry_core::endpoint::MulticastEndpoint;
use tapestry_core::error::Result;
use tapestry_core::properties::TransportProperties;
use tapestry_framing::Framer;
use tapestry_transport::{Channel, ChannelOption, CloseMode, StackError};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::debug;

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Produces connections that send to a multicast group
pub struct MulticastSender {
    endpoint: MulticastEndpoint,
    properties: TransportProperties,
    framers: Vec<Arc<dyn Framer>>,
}

impl MulticastSender {
    pub fn new(endpoint: MulticastEndpoint) -> Self {
        Self {
            endpoint,
            properties: TransportProperties::unreliable_datagram(),
            framers: Vec::new(),
        }
    }

    pub fn with_properties(mut self, properties: TransportProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn add_framer(mut self, framer: Arc<dyn Framer>) -> Self {
        self.framers.push(framer);
        self
    }

    /// Bind and produce the sending connection
    pub async fn establish(&self) -> Result<Connection> {
        self.endpoint.validate()?;

        let bind: SocketAddr = if self.endpoint.group.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid wildcard")
        } else {
            "[::]:0".parse().expect("valid wildcard")
        };
        let raw = socket::bind_socket(&self.endpoint, bind)?;
        socket::apply_send_options(&raw, &self.endpoint)?;
        let udp = socket::into_tokio(raw)?;

        let group = SocketAddr::new(self.endpoint.group, self.endpoint.port);
        debug!(%group, "multicast sender established");
        Ok(Connection::from_channel(
            Box::new(MulticastSendChannel {
                socket: udp,
                group,
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
            self.properties.clone(),
            self.framers.clone(),
        ))
    }
}

/// Channel addressing every write to the group
struct MulticastSendChannel {
    socket: UdpSocket,
    group: SocketAddr,
    closed: AtomicBool,
    close_notify: Notify,
}

#[async_trait]
impl Channel for MulticastSendChannel {
    async fn write(&self, bytes: &[u8]) -> tapestry_transport::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StackError::Closed);
        }
        self.socket.send_to(bytes, self.group).await?;
        Ok(())
    }

    async fn read(&self) -> tapestry_transport::Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        tokio::select! {
            received = self.socket.recv_from(&mut buf) => {
                let (n, _source) = received?;
                buf.truncate(n);
                Ok(Some(buf))
            }
            _ = self.close_notify.notified() => Ok(None),
        }
    }

    async fn close_send(&self) -> tapestry_transport::Result<()> {
        Ok(())
    }

    async fn close(&self, _mode: CloseMode) -> tapestry_transport::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.group)
    }

    async fn set_option(&self, option: ChannelOption) -> tapestry_transport::Result<()> {
        match option {
            ChannelOption::NoDelay(_) => Ok(()),
            ChannelOption::KeepAlive(_) => Err(StackError::Unsupported(
                "keep-alive on a multicast channel".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapestry_core::message::Message;

    #[tokio::test]
    async fn test_sender_establish_and_send() {
        let endpoint = MulticastEndpoint::new("239.255.42.97".parse().unwrap(), 49197)
            .with_interface("127.0.0.1")
            .with_loopback(true);
        let sender = MulticastSender::new(endpoint);

        let connection = sender.establish().await.unwrap();
        assert!(connection.is_established());
        assert_eq!(
            connection.remote_addr(),
            Some("239.255.42.97:49197".parse().unwrap())
        );

        // Sending into the void is valid for datagram multicast.
        connection.send(Message::new(b"beacon".as_slice())).await.unwrap();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_group_rejected() {
        let endpoint = MulticastEndpoint::new("10.1.2.3".parse().unwrap(), 5000);
        assert!(MulticastSender::new(endpoint).establish().await.is_err());
    }
}
