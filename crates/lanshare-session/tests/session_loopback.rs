//! Two session engines on loopback: dial, exchange encrypted records both
//! ways, tear down, and check the unknown-peer path.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use lanshare_crypto::identity;
use lanshare_session::{
    spawn, IsKnownFn, LocalIdentity, PeerSender, SessionConfig, SessionEvent, SessionHandle,
};
use lanshare_types::PeerId;

fn new_identity() -> LocalIdentity {
    let (public, secret) = identity::generate().unwrap();
    LocalIdentity {
        peer: PeerId(public),
        secret,
    }
}

fn always_known() -> IsKnownFn {
    Arc::new(|_| Box::pin(async { true }))
}

fn never_known() -> IsKnownFn {
    Arc::new(|_| Box::pin(async { false }))
}

struct Endpoint {
    identity: LocalIdentity,
    handle: SessionHandle,
    port: u16,
    events: mpsc::Receiver<SessionEvent>,
}

fn start(is_known: IsKnownFn) -> Endpoint {
    let identity = new_identity();
    let (events_tx, events) = mpsc::channel(256);
    let (handle, port) = spawn(SessionConfig {
        identity: identity.clone(),
        listen_port: 0,
        is_known,
        events: events_tx,
    })
    .unwrap();
    Endpoint {
        identity,
        handle,
        port,
        events,
    }
}

async fn next_event(endpoint: &mut Endpoint) -> SessionEvent {
    timeout(Duration::from_secs(5), endpoint.events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}

async fn expect_connected(endpoint: &mut Endpoint) -> (PeerId, PeerSender, bool) {
    match next_event(endpoint).await {
        SessionEvent::Connected {
            peer,
            sender,
            known,
        } => (peer, sender, known),
        other => panic!("expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn connect_and_exchange_records() {
    let mut a = start(always_known());
    let mut b = start(always_known());

    a.handle
        .connect(b.identity.peer, "127.0.0.1".into(), b.port)
        .await;

    let (peer_at_a, sender_a, known_a) = expect_connected(&mut a).await;
    let (peer_at_b, sender_b, _known_b) = expect_connected(&mut b).await;
    assert_eq!(peer_at_a, b.identity.peer);
    assert_eq!(peer_at_b, a.identity.peer);
    assert!(known_a);

    // A → B.
    assert!(!sender_a.enqueue(Bytes::from_static(b"ping from a")));
    match next_event(&mut b).await {
        SessionEvent::Record { peer, plaintext } => {
            assert_eq!(peer, a.identity.peer);
            assert_eq!(&plaintext[..], b"ping from a");
        }
        other => panic!("expected Record, got {other:?}"),
    }

    // B → A, several records, order preserved.
    for i in 0..20u8 {
        sender_b.enqueue(Bytes::from(vec![i; 16]));
    }
    for i in 0..20u8 {
        match next_event(&mut a).await {
            SessionEvent::Record { plaintext, .. } => assert_eq!(plaintext[0], i),
            other => panic!("expected Record, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn disconnect_fires_on_both_sides() {
    let mut a = start(always_known());
    let mut b = start(always_known());

    a.handle
        .connect(b.identity.peer, "127.0.0.1".into(), b.port)
        .await;
    expect_connected(&mut a).await;
    expect_connected(&mut b).await;

    a.handle.disconnect(b.identity.peer).await;

    match next_event(&mut a).await {
        SessionEvent::Disconnected { peer } => assert_eq!(peer, b.identity.peer),
        other => panic!("expected Disconnected, got {other:?}"),
    }
    match next_event(&mut b).await {
        SessionEvent::Disconnected { peer } => assert_eq!(peer, a.identity.peer),
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_peer_still_connects_but_is_flagged() {
    let mut a = start(always_known());
    // B's store knows nobody.
    let mut b = start(never_known());

    a.handle
        .connect(b.identity.peer, "127.0.0.1".into(), b.port)
        .await;

    expect_connected(&mut a).await;
    let (_, _, known) = expect_connected(&mut b).await;
    assert!(!known);
}

#[tokio::test]
async fn tampered_record_closes_the_connection() {
    let mut server = start(always_known());
    let client = new_identity();

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", server.port))
        .await
        .unwrap();
    let mut established =
        lanshare_session::handshake::connect(&mut stream, &client, server.identity.peer)
            .await
            .unwrap();
    expect_connected(&mut server).await;

    // A valid first record proves the channel works.
    let good = established.tx.seal(b"\xB3\x15\x03\x00fine");
    lanshare_session::record::write_record(&mut stream, &good)
        .await
        .unwrap();
    match next_event(&mut server).await {
        SessionEvent::Record { plaintext, .. } => assert_eq!(&plaintext[4..], b"fine"),
        other => panic!("expected Record, got {other:?}"),
    }

    // One flipped ciphertext byte: authentication fails and the server
    // closes within this record.
    let mut bad = established.tx.seal(b"\xB3\x15\x03\x00evil");
    bad[0] ^= 0x01;
    lanshare_session::record::write_record(&mut stream, &bad)
        .await
        .unwrap();

    match next_event(&mut server).await {
        SessionEvent::Disconnected { peer } => assert_eq!(peer, client.peer),
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

#[tokio::test]
async fn dial_failure_reports_disconnected() {
    let mut a = start(always_known());
    let ghost = new_identity().peer;

    // Nobody listens on this port.
    a.handle.connect(ghost, "127.0.0.1".into(), 1).await;
    match next_event(&mut a).await {
        SessionEvent::Disconnected { peer } => assert_eq!(peer, ghost),
        other => panic!("expected Disconnected, got {other:?}"),
    }
}
