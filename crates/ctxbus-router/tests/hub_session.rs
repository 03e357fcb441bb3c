#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

//! Hub sessions driven directly over raw pipes.

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use ctxbus_core::error::RouteError;
use ctxbus_core::{ClientHello, Environment, Frame, PeerId, ServerHello, TabId};
use ctxbus_router::config::HubSection;
use ctxbus_router::hub::{DeliverOutcome, PeerStatus, PeerTable};
use ctxbus_router::transport::{pipe, DirectLink, Endpoint, Packet};
use ctxbus_router::Hub;

const WAIT: Duration = Duration::from_secs(3);

fn hello(peer_id: Option<PeerId>) -> ClientHello {
    ClientHello {
        environment: Environment::SATELLITE | Environment::DIRECT_ACCESS,
        peer_id,
    }
}

async fn join(hub: &Hub, tab_id: TabId, peer_id: Option<PeerId>) -> (Endpoint, ServerHello) {
    let (mut client, server) = pipe();
    hub.accept(server, tab_id);
    client
        .tx
        .send(Packet::Frame(Frame::ClientHello(hello(peer_id))))
        .unwrap();
    match timeout(WAIT, client.rx.recv()).await.unwrap() {
        Some(Packet::Frame(Frame::ServerHello(h))) => (client, h),
        other => panic!("expected server_hello, got {other:?}"),
    }
}

#[tokio::test]
async fn send_into_a_dead_transport_is_held_for_reconnect() {
    let hub = Hub::new(HubSection::default());
    let (client, first) = join(&hub, 1, None).await;
    let id = first.peer_id;

    // Downstream is gone but the session has not seen the loss yet.
    let Endpoint { tx: upstream, rx } = client;
    drop(rx);

    hub.channels("sync")
        .channel("state")
        .send_to_peer(id, json!("late"))
        .await
        .unwrap();
    assert_eq!(hub.peer_status(id), Some(PeerStatus::Pending { queued: 1 }));

    let (mut again, second) = join(&hub, 1, Some(id)).await;
    assert_eq!(second.peer_id, id);
    match timeout(WAIT, again.rx.recv()).await.unwrap() {
        Some(Packet::Frame(Frame::Route(env))) => {
            assert_eq!(env.data, json!("late"));
            assert_eq!(env.origin_peer_id, Some(hub.local_peer_id()));
        }
        other => panic!("expected the held route frame, got {other:?}"),
    }

    // The stale session closing must not touch the restored record.
    drop(upstream);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.peer_status(id), Some(PeerStatus::Live));
}

#[tokio::test]
async fn non_hello_first_frame_closes_the_session() {
    let hub = Hub::new(HubSection::default());
    let (mut client, server) = pipe();
    hub.accept(server, 1);

    client.tx.send(Packet::Frame(Frame::Farewell)).unwrap();
    assert!(timeout(WAIT, client.rx.recv()).await.unwrap().is_none());
    assert_eq!(hub.peer_count(), 0);
}

#[tokio::test]
async fn silent_peer_is_dropped_after_handshake_timeout() {
    let hub = Hub::new(HubSection {
        handshake_timeout_ms: 100,
        ..HubSection::default()
    });
    let (mut client, server) = pipe();
    hub.accept(server, 1);

    assert!(timeout(WAIT, client.rx.recv()).await.unwrap().is_none());
    assert_eq!(hub.peer_count(), 0);
}

#[test]
fn handshake_errors_are_protocol_class() {
    let e = RouteError::Handshake("no client_hello within 100ms".into());
    assert_eq!(e.class().as_str(), "PROTOCOL");
}

#[tokio::test]
async fn table_returns_the_packet_when_the_transport_is_closed() {
    let table = PeerTable::new();
    let (client, server) = pipe();
    let attached = table.attach(&hello(None), 1, server.tx);
    drop(client);

    match table.deliver(attached.peer_id, Packet::Frame(Frame::Farewell)) {
        DeliverOutcome::Failed {
            generation,
            packet: Packet::Frame(Frame::Farewell),
        } => assert_eq!(generation, attached.generation),
        other => panic!("expected failed delivery, got {other:?}"),
    }
}

#[tokio::test]
async fn links_are_never_queued_for_pending_peers() {
    let table = PeerTable::new();
    let (_client, server) = pipe();
    let attached = table.attach(&hello(None), 1, server.tx);

    let timer = tokio::spawn(std::future::pending::<()>()).abort_handle();
    assert!(table.mark_pending(attached.peer_id, attached.generation, timer));

    let (end, _other) = pipe();
    let link = Packet::Link(DirectLink {
        peer_id: PeerId::random(),
        endpoint: end,
    });
    assert!(!table.deliver_live(attached.peer_id, link));
    assert_eq!(
        table.status(attached.peer_id),
        Some(PeerStatus::Pending { queued: 0 })
    );
}
