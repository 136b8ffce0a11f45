//! End-to-end tests for the identity exchange between two clients.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test identity_exchange -- --nocapture

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use plume::messages::{Message, OP_CERT, OP_CONNECT, RoutedMessage};
use plume::relay::MAX_COOKIES_PER_CHANNEL;
use plume::rendezvous::PROBE_INTERVAL;
use plume::{
    AddressMode, ClientConfig, Credentials, PeerEvent, PeerState, PlumeClient, RelayServer,
    StaticResolver,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn client(
    ca: &TestCa,
    relay: &RelayServer,
    credentials: Credentials,
    mode: AddressMode,
) -> (PlumeClient, mpsc::Receiver<PeerEvent>) {
    let mut config = client_config(ca, relay, credentials).with_address_mode(mode);
    if let Some(echo) = relay.echo_addr() {
        config = config.with_echo(echo);
    }
    connect(relay, config).await
}

fn client_config(ca: &TestCa, relay: &RelayServer, credentials: Credentials) -> ClientConfig {
    ClientConfig::new(credentials, ca.trust(), Arc::new(StaticResolver::new()))
        .with_relay("127.0.0.1", relay.local_addr().port())
}

async fn connect(
    relay: &RelayServer,
    config: ClientConfig,
) -> (PlumeClient, mpsc::Receiver<PeerEvent>) {
    let (client, events) = PlumeClient::connect(config).await.expect("client connect");
    wait_connected(relay, client.identity()).await;
    (client, events)
}

async fn next_event(events: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("event timed out")
        .expect("client stopped")
}

#[tokio::test]
async fn local_addresses_cross_domains() {
    init_tracing();
    let ca = TestCa::new();
    let resolver = Arc::new(StaticResolver::new());
    let relay_a = ca.relay("a.test", resolver.clone()).await;
    let relay_b = ca.relay("b.test", resolver.clone()).await;
    resolver.insert("_plume._tcp.a.test", "127.0.0.1", relay_a.local_addr().port());
    resolver.insert("_plume._tcp.b.test", "127.0.0.1", relay_b.local_addr().port());

    let alice_addr: SocketAddr = "192.0.2.1:4000".parse().unwrap();
    let bob_addr: SocketAddr = "198.51.100.7:5000".parse().unwrap();
    let (alice, mut alice_events) = client(
        &ca,
        &relay_a,
        ca.login_credentials("alice@a.test"),
        AddressMode::Local(alice_addr),
    )
    .await;
    let (bob, mut bob_events) = client(
        &ca,
        &relay_b,
        ca.login_credentials("bob@b.test"),
        AddressMode::Local(bob_addr),
    )
    .await;

    alice.connect_peer("bob@b.test").await.unwrap();
    assert_eq!(
        next_event(&mut alice_events).await,
        PeerEvent::Announced {
            peer: identity("bob@b.test"),
            addr: alice_addr,
        }
    );
    assert_eq!(
        next_event(&mut bob_events).await,
        PeerEvent::Connected {
            peer: identity("alice@a.test"),
            addr: alice_addr,
        }
    );
    assert_eq!(alice.peer_state(&identity("bob@b.test")).await, Some(PeerState::Ready));

    // Bob already holds Alice's certificate, so no identify round trip.
    bob.connect_peer("alice@a.test").await.unwrap();
    assert!(matches!(
        next_event(&mut bob_events).await,
        PeerEvent::Announced { addr, .. } if addr == bob_addr
    ));
    assert_eq!(
        next_event(&mut alice_events).await,
        PeerEvent::Connected {
            peer: identity("bob@b.test"),
            addr: bob_addr,
        }
    );
}

#[tokio::test]
async fn rendezvous_announces_observed_address() {
    init_tracing();
    let ca = TestCa::new();
    let relay = ca.relay("a.test", Arc::new(StaticResolver::new())).await;

    let (alice, mut alice_events) = client(
        &ca,
        &relay,
        ca.login_credentials("alice@a.test"),
        AddressMode::Rendezvous,
    )
    .await;
    let (_bob, mut bob_events) = client(
        &ca,
        &relay,
        ca.login_credentials("bob@a.test"),
        AddressMode::Rendezvous,
    )
    .await;

    alice.connect_peer("bob@a.test").await.unwrap();

    let PeerEvent::Announced { peer, addr: announced } = next_event(&mut alice_events).await else {
        panic!("expected an announcement");
    };
    assert_eq!(peer, identity("bob@a.test"));
    assert!(announced.ip().is_loopback());
    assert_ne!(announced.port(), 0);

    assert_eq!(
        next_event(&mut bob_events).await,
        PeerEvent::Connected {
            peer: identity("alice@a.test"),
            addr: announced,
        }
    );
    assert_eq!(relay.cookie_count().await, 0);
}

#[tokio::test]
async fn refused_cookie_fails_rendezvous() {
    init_tracing();
    let ca = TestCa::new();
    let relay = ca.relay("a.test", Arc::new(StaticResolver::new())).await;

    let config = client_config(&ca, &relay, ca.login_credentials("alice@a.test"))
        .with_echo(relay.echo_addr().expect("echo enabled"))
        .with_rendezvous_ack_timeout(Duration::from_millis(500));
    let (alice, mut alice_events) = connect(&relay, config).await;
    let (_bob, _bob_events) = client(
        &ca,
        &relay,
        ca.login_credentials("bob@a.test"),
        AddressMode::Local("192.0.2.2:1".parse().unwrap()),
    )
    .await;

    // Use up Alice's cookie allowance so the relay refuses her next one.
    for cookie in 0..MAX_COOKIES_PER_CHANNEL as u64 {
        alice.channel().send(Message::Udp { cookie }).await.unwrap();
    }
    timeout(TEST_TIMEOUT, async {
        while relay.cookie_count().await < MAX_COOKIES_PER_CHANNEL {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cookies never registered");

    alice.connect_peer("bob@a.test").await.unwrap();
    assert_eq!(
        next_event(&mut alice_events).await,
        PeerEvent::RendezvousFailed {
            peer: identity("bob@a.test"),
        }
    );
    assert_eq!(alice.peer_state(&identity("bob@a.test")).await, None);
    assert!(!alice.channel().is_closed());
}

#[tokio::test]
async fn undrained_events_do_not_stall_client() {
    init_tracing();
    let ca = TestCa::new();
    let relay = ca.relay("a.test", Arc::new(StaticResolver::new())).await;

    // Neither side ever reads its events.
    let (alice, _alice_events) = client(
        &ca,
        &relay,
        ca.login_credentials("alice@a.test"),
        AddressMode::Local("192.0.2.1:1".parse().unwrap()),
    )
    .await;
    let (bob, _bob_events) = client(
        &ca,
        &relay,
        ca.login_credentials("bob@a.test"),
        AddressMode::Local("192.0.2.2:1".parse().unwrap()),
    )
    .await;

    bob.connect_peer("alice@a.test").await.unwrap();
    timeout(TEST_TIMEOUT, async {
        while bob.peer_state(&identity("alice@a.test")).await != Some(PeerState::Ready) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bob never learned alice's certificate");

    // Well past the event queue capacity, in rounds the relay can keep up with.
    for _ in 0..5 {
        for _ in 0..20 {
            bob.connect_peer("alice@a.test").await.unwrap();
        }
        let state = timeout(TEST_TIMEOUT, bob.peer_state(&identity("alice@a.test")))
            .await
            .expect("bob stalled");
        assert_eq!(state, Some(PeerState::Ready));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::time::sleep(QUIET_PERIOD).await;
    let state = timeout(TEST_TIMEOUT, alice.peer_state(&identity("bob@a.test")))
        .await
        .expect("alice stalled");
    assert_eq!(state, None);
    assert!(!alice.channel().is_closed());
}

#[tokio::test]
async fn closing_client_stops_cookie_datagrams() {
    init_tracing();
    let ca = TestCa::new();
    let relay = ca.relay("a.test", Arc::new(StaticResolver::new())).await;

    // Stands in for an echo service that never reports back.
    let sink = UdpSocket::bind(loopback()).await.unwrap();
    let config = client_config(&ca, &relay, ca.login_credentials("alice@a.test"))
        .with_echo(sink.local_addr().unwrap());
    let (alice, _alice_events) = connect(&relay, config).await;
    let (_bob, _bob_events) = client(
        &ca,
        &relay,
        ca.login_credentials("bob@a.test"),
        AddressMode::Local("192.0.2.2:1".parse().unwrap()),
    )
    .await;

    alice.connect_peer("bob@a.test").await.unwrap();
    let mut buf = [0u8; 64];
    timeout(TEST_TIMEOUT, sink.recv_from(&mut buf))
        .await
        .expect("no cookie datagram")
        .unwrap();

    alice.close();
    expect_closed(alice.channel()).await;

    // A datagram already in flight may still land.
    tokio::time::sleep(PROBE_INTERVAL).await;
    while sink.try_recv_from(&mut buf).is_ok() {}

    let late = timeout(PROBE_INTERVAL * 3, sink.recv_from(&mut buf)).await;
    assert!(late.is_err(), "cookie datagrams kept arriving after close");
}

#[tokio::test]
async fn forged_connect_closes_recipient() {
    init_tracing();
    let ca = TestCa::new();
    let relay = ca.relay("a.test", Arc::new(StaticResolver::new())).await;

    let (bob, _bob_events) = client(
        &ca,
        &relay,
        ca.login_credentials("bob@a.test"),
        AddressMode::Local("192.0.2.2:1".parse().unwrap()),
    )
    .await;

    let mallory = ca.credentials("mallory@a.test");
    let (channel, _inbound) = ca.raw_channel(&relay, &mallory).await;
    let forged = RoutedMessage::new(
        mallory.certificate().to_vec(),
        "bob@a.test",
        OP_CONNECT,
        b"definitely not sealed".to_vec(),
    );
    channel.send(Message::Route(forged)).await.unwrap();

    expect_closed(bob.channel()).await;
    assert!(!channel.is_closed());
}

#[tokio::test]
async fn unsolicited_certificate_is_ignored() {
    init_tracing();
    let ca = TestCa::new();
    let relay = ca.relay("a.test", Arc::new(StaticResolver::new())).await;

    let (bob, _bob_events) = client(
        &ca,
        &relay,
        ca.login_credentials("bob@a.test"),
        AddressMode::Local("192.0.2.2:1".parse().unwrap()),
    )
    .await;

    let mallory = ca.credentials("mallory@a.test");
    let (channel, _inbound) = ca.raw_channel(&relay, &mallory).await;
    let cert = RoutedMessage::new(
        mallory.certificate().to_vec(),
        "bob@a.test",
        OP_CERT,
        Vec::new(),
    );
    channel.send(Message::Route(cert)).await.unwrap();

    tokio::time::sleep(QUIET_PERIOD).await;
    assert!(!bob.channel().is_closed());
    assert_eq!(bob.peer_state(mallory.identity()).await, None);
}

#[tokio::test]
async fn untrusted_sender_certificate_closes_recipient() {
    init_tracing();
    let ca = TestCa::new();
    let other = TestCa::new();
    let relay = ca.relay("a.test", Arc::new(StaticResolver::new())).await;

    let (bob, _bob_events) = client(
        &ca,
        &relay,
        ca.login_credentials("bob@a.test"),
        AddressMode::Local("192.0.2.2:1".parse().unwrap()),
    )
    .await;

    // The relay does not check sender_cert; the recipient does.
    let mallory = ca.credentials("mallory@a.test");
    let forged_sender = other.credentials("alice@a.test");
    let (channel, _inbound) = ca.raw_channel(&relay, &mallory).await;
    let identify = RoutedMessage::new(
        forged_sender.certificate().to_vec(),
        "bob@a.test",
        plume::messages::OP_IDENTIFY,
        Vec::new(),
    );
    channel.send(Message::Route(identify)).await.unwrap();

    expect_closed(bob.channel()).await;
}
