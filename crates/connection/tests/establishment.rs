//! End-to-end establishment scenarios over real localhost sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tapestry_connection::{ConnectionState, Preconnection};
use tapestry_core::config::TapestryConfig;
use tapestry_core::endpoint::Endpoint;
use tapestry_core::error::TransportError;
use tapestry_core::message::{Message, MessageContext};
use tapestry_core::properties::{Preference, TransportProperties};
use tapestry_core::security::SecurityParameters;
use tapestry_framing::LengthPrefixFramer;
use tapestry_transport::{ProtocolStack, TcpStack};

fn loopback() -> Endpoint {
    Endpoint::ip("127.0.0.1".parse().unwrap())
}

/// A localhost UDP port that was free a moment ago
async fn free_udp_port() -> u16 {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

#[tokio::test]
async fn echo_over_localhost_with_length_prefix_framer() {
    let server_pre = Preconnection::new(TransportProperties::default())
        .add_local(loopback().with_port(0))
        .add_framer(Arc::new(LengthPrefixFramer::new()));
    let listener = server_pre.listen().await.unwrap();
    let addr = listener.local_addrs()[0];

    let client_pre = Preconnection::new(TransportProperties::default())
        .add_remote(loopback().with_port(addr.port()))
        .add_framer(Arc::new(LengthPrefixFramer::new()));

    let (client, accepted) = tokio::join!(client_pre.initiate(), listener.accept());
    let client = client.unwrap();
    let server = accepted.unwrap();

    client.send(Message::new(b"ping".as_slice())).await.unwrap();
    let request = server.receive().await.unwrap();
    assert_eq!(request.data, b"ping");
    assert!(!request.context.safely_replayable);
    assert!(!request.context.final_message);

    server.send(Message::new(b"pong".as_slice())).await.unwrap();
    let response = client.receive().await.unwrap();
    assert_eq!(response.data, b"pong");

    client.close().await.unwrap();
    server.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.state(), ConnectionState::Closed);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn final_message_half_closes_and_blocks_later_sends() {
    let server_pre = Preconnection::new(TransportProperties::default())
        .add_local(loopback().with_port(0))
        .add_framer(Arc::new(LengthPrefixFramer::new()));
    let listener = server_pre.listen().await.unwrap();
    let addr = listener.local_addrs()[0];

    let client_pre = Preconnection::new(TransportProperties::default())
        .add_remote(loopback().with_port(addr.port()))
        .add_framer(Arc::new(LengthPrefixFramer::new()));

    let (client, accepted) = tokio::join!(client_pre.initiate(), listener.accept());
    let client = client.unwrap();
    let server = accepted.unwrap();

    client.send(Message::final_message(b"bye".as_slice())).await.unwrap();
    assert_eq!(
        client.send(Message::new(b"x".as_slice())).await,
        Err(TransportError::SendAfterFinal)
    );

    let last = server.receive().await.unwrap();
    assert_eq!(last.data, b"bye");
    assert!(last.context.final_message);

    // After the final message the peer observes the close.
    assert_eq!(server.receive().await, Err(TransportError::ConnectionClosed));
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn racing_prefers_the_reachable_remote() {
    let server_pre = Preconnection::new(TransportProperties::default())
        .add_local(loopback().with_port(0));
    let listener = server_pre.listen().await.unwrap();
    let addr = listener.local_addrs()[0];

    // TEST-NET-1 is filtered: the attempt neither completes nor refuses
    // quickly, so the stagger launches the loopback candidate which wins.
    let client_pre = Preconnection::new(TransportProperties::default())
        .add_remote(Endpoint::ip("198.51.100.1".parse().unwrap()).with_port(80))
        .add_remote(loopback().with_port(addr.port()));

    let started = Instant::now();
    let (client, accepted) = tokio::join!(client_pre.initiate(), listener.accept());
    let client = client.unwrap();
    let elapsed = started.elapsed();

    let remote = client.remote_addr().unwrap();
    let expected: SocketAddr = format!("127.0.0.1:{}", addr.port()).parse().unwrap();
    assert_eq!(remote, expected);
    assert!(
        elapsed < Duration::from_secs(10),
        "racing took {:?}, the filtered attempt was not overtaken",
        elapsed
    );

    // The winning connection is usable end to end.
    let server = accepted.unwrap();
    client.send(Message::new(b"via-racer".as_slice())).await.unwrap();
    assert_eq!(server.receive().await.unwrap().data, b"via-racer");

    client.close().await.unwrap();
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn rendezvous_establishes_exactly_one_connection_per_peer() {
    // Datagram rendezvous: each peer's port-bound outbound channel pairs
    // with the other side's, so the exchange below is deterministic.
    let port_a = free_udp_port().await;
    let port_b = free_udp_port().await;

    let peer_a = Preconnection::new(TransportProperties::unreliable_datagram())
        .add_local(loopback().with_port(port_a))
        .add_remote(loopback().with_port(port_b));
    let peer_b = Preconnection::new(TransportProperties::unreliable_datagram())
        .add_local(loopback().with_port(port_b))
        .add_remote(loopback().with_port(port_a));

    let (conn_a, conn_b) = tokio::join!(peer_a.rendezvous(), peer_b.rendezvous());
    let conn_a = conn_a.unwrap();
    let conn_b = conn_b.unwrap();

    conn_a.send(Message::new(b"hello from a".as_slice())).await.unwrap();
    assert_eq!(conn_b.receive().await.unwrap().data, b"hello from a");

    conn_b.send(Message::new(b"hello from b".as_slice())).await.unwrap();
    assert_eq!(conn_a.receive().await.unwrap().data, b"hello from b");

    conn_a.close().await.unwrap();
    conn_b.close().await.unwrap();
}

#[tokio::test]
async fn zero_rtt_require_fails_and_prefer_falls_back() {
    let server_pre = Preconnection::new(TransportProperties::default())
        .add_local(loopback().with_port(0))
        .add_framer(Arc::new(LengthPrefixFramer::new()));
    let listener = server_pre.listen().await.unwrap();
    let addr = listener.local_addrs()[0];

    let message = Message::with_context(
        b"first flight".as_slice(),
        MessageContext::new().safely_replayable(),
    );

    // Require: no reliable stack offers zero-RTT, so gathering is empty.
    let mut require = TransportProperties::default();
    require.zero_rtt = Preference::Require;
    require.conn_timeout = Some(Duration::from_secs(2));
    let result = Preconnection::new(require)
        .add_remote(loopback().with_port(addr.port()))
        .add_framer(Arc::new(LengthPrefixFramer::new()))
        .initiate_with_send(message.clone())
        .await;
    assert!(matches!(
        result,
        Err(TransportError::EstablishmentFailure(_))
    ));

    // Prefer: the stream stack is selected and the message is delivered.
    let mut prefer = TransportProperties::default();
    prefer.zero_rtt = Preference::Prefer;
    let client = Preconnection::new(prefer)
        .add_remote(loopback().with_port(addr.port()))
        .add_framer(Arc::new(LengthPrefixFramer::new()))
        .initiate_with_send(message)
        .await
        .unwrap();

    let server = listener.accept().await.unwrap();
    let received = server.receive().await.unwrap();
    assert_eq!(received.data, b"first flight");
    assert!(received.context.safely_replayable);

    client.close().await.unwrap();
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn oversize_frame_closes_the_connection() {
    // Raw server without framers, so it can write a bogus frame header.
    let stack = TcpStack::new();
    let server = stack
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            &TransportProperties::default(),
            &SecurityParameters::disabled(),
        )
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let client_pre = Preconnection::new(TransportProperties::default())
        .add_remote(loopback().with_port(addr.port()))
        .add_framer(Arc::new(LengthPrefixFramer::new()));

    let (client, accepted) = tokio::join!(client_pre.initiate(), server.accept());
    let client = client.unwrap();
    let raw_peer = accepted.unwrap();

    // 4-byte length 0x00200001 (2 MiB + 1) followed by some bytes.
    raw_peer
        .write(&[0x00, 0x20, 0x00, 0x01, 0xAA, 0xBB, 0xCC])
        .await
        .unwrap();

    let result = client.receive().await;
    assert!(
        matches!(result, Err(TransportError::ReceiveFailure(_))),
        "got {:?}",
        result
    );

    // The connection transitioned to closed once the framer rejected it.
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.state() != ConnectionState::Closed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should close after an invalid frame");
}

#[tokio::test]
async fn clone_joins_group_and_group_close_is_atomic() {
    let server_pre = Preconnection::new(TransportProperties::default())
        .add_local(loopback().with_port(0));
    let listener = server_pre.listen().await.unwrap();
    let addr = listener.local_addrs()[0];

    let client_pre = Preconnection::new(TransportProperties::default())
        .add_remote(loopback().with_port(addr.port()));

    let (client, first_accept) = tokio::join!(client_pre.initiate(), listener.accept());
    let client = client.unwrap();
    drop(first_accept);

    let (clone, second_accept) =
        tokio::join!(client.clone_connection(None, None), listener.accept());
    let clone = clone.unwrap();
    drop(second_accept);

    // Independent-connection fallback: nothing is aliased.
    assert!(clone.cloned_as_independent());
    assert!(!client.cloned_as_independent());
    assert_ne!(client.local_addr(), clone.local_addr());

    let group = client.group().expect("clone forms a group");
    assert_eq!(group.len(), 2);
    assert!(group.contains(client.id()));
    assert!(group.contains(clone.id()));

    client.close_group().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(clone.state(), ConnectionState::Closed);
    assert!(group.is_empty());

    listener.stop().await.unwrap();
}

#[tokio::test]
async fn listener_connection_limit_rejects_overflow() {
    let mut config = TapestryConfig::default();
    config.listener.connection_limit = Some(1);

    let server_pre = Preconnection::new(TransportProperties::default())
        .add_local(loopback().with_port(0))
        .with_config(config);
    let listener = server_pre.listen().await.unwrap();
    let addr = listener.local_addrs()[0];

    let client_pre = Preconnection::new(TransportProperties::default())
        .add_remote(loopback().with_port(addr.port()));

    let (first, accepted) = tokio::join!(client_pre.initiate(), listener.accept());
    let first = first.unwrap();
    let _accepted = accepted.unwrap();

    // The transport-level connect still succeeds; the listener closes the
    // channel immediately instead of yielding it.
    let second = client_pre.initiate().await.unwrap();
    assert_eq!(second.receive().await, Err(TransportError::ConnectionClosed));

    tokio::time::timeout(Duration::from_secs(2), async {
        while listener.stats().rejected == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("over-limit channel should be rejected");
    assert_eq!(listener.stats().accepted, 1);

    first.close().await.unwrap();
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn listener_stop_finishes_the_stream() {
    let server_pre = Preconnection::new(TransportProperties::default())
        .add_local(loopback().with_port(0));
    let listener = server_pre.listen().await.unwrap();

    listener.stop().await.unwrap();
    assert!(!listener.is_active());
    assert!(listener.accept().await.is_none());
}

#[tokio::test]
async fn established_remote_matches_a_resolved_remote() {
    let server_pre = Preconnection::new(TransportProperties::default())
        .add_local(loopback().with_port(0));
    let listener = server_pre.listen().await.unwrap();
    let addr = listener.local_addrs()[0];

    let client = Preconnection::new(TransportProperties::default())
        .add_remote(Endpoint::host("localhost").with_port(addr.port()))
        .initiate()
        .await
        .unwrap();

    let remote = client.remote_addr().unwrap();
    assert!(remote.ip().is_loopback());
    assert_eq!(remote.port(), addr.port());

    client.close().await.unwrap();
    listener.stop().await.unwrap();
}
