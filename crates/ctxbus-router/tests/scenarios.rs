#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

//! End-to-end routing over the in-process transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use ctxbus_core::error::{Result, RouteError};
use ctxbus_core::target::INCLUDE_LOCAL;
use ctxbus_core::{Environment, PeerId, Presentation, TabId, TargetFlags, TargetSpec, NO_TAB};
use ctxbus_router::config::{HubSection, PeerSection};
use ctxbus_router::hub::PeerStatus;
use ctxbus_router::payload::PayloadCodec;
use ctxbus_router::transport::MemoryConnector;
use ctxbus_router::{Channels, Delivery, Hub, PeerConnector, Phase, Subscription};

const WAIT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(150);

fn hub_cfg(grace_ms: u64) -> HubSection {
    HubSection {
        grace_ms,
        ..HubSection::default()
    }
}

fn peer_cfg(tab_id: TabId) -> PeerSection {
    PeerSection {
        tab_id,
        backoff_initial_ms: 10,
        backoff_max_ms: 40,
        ..PeerSection::default()
    }
}

struct Satellite {
    conn: PeerConnector,
    link: Arc<MemoryConnector>,
}

impl Satellite {
    async fn start(hub: &Hub, env: Environment, tab_id: TabId) -> Self {
        let link = Arc::new(MemoryConnector::new(hub.clone(), tab_id));
        let conn = PeerConnector::start(peer_cfg(tab_id), env, link.clone());
        assert!(conn.wait_for_phase(Phase::Connected, WAIT).await, "satellite never connected");
        Self { conn, link }
    }

    fn id(&self) -> PeerId {
        self.conn.peer_id().expect("connected")
    }
}

type Inbox = mpsc::UnboundedReceiver<Delivery>;

fn listen(channels: &Channels, event: &str) -> (Subscription, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = channels.channel(event).on(move |d| {
        let _ = tx.send(d.clone());
        Ok(())
    });
    (sub, rx)
}

async fn next(inbox: &mut Inbox) -> Delivery {
    tokio::time::timeout(WAIT, inbox.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("inbox closed")
}

async fn silent(inbox: &mut Inbox) {
    tokio::time::sleep(QUIET).await;
    if let Ok(d) = inbox.try_recv() {
        panic!("unexpected delivery: {d:?}");
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn flags(env: Environment, modifiers: u32) -> TargetSpec {
    TargetSpec::Flags(TargetFlags::of(env, modifiers).unwrap())
}

#[tokio::test]
async fn satellite_broadcast_skips_hub_and_sender() {
    let hub = Hub::new(hub_cfg(1000));
    let sat = Satellite::start(&hub, Environment::SATELLITE, 1).await;

    let (_h, mut hub_inbox) = listen(&hub.channels("ui"), "ping");
    let sat_channels = sat.conn.channels("ui");
    let (_s, mut sat_inbox) = listen(&sat_channels, "ping");

    sat_channels
        .channel("ping")
        .send(flags(Environment::SATELLITE, 0), json!(1))
        .await
        .unwrap();

    silent(&mut hub_inbox).await;
    silent(&mut sat_inbox).await;
}

#[tokio::test]
async fn include_local_delivers_to_sender_only() {
    let hub = Hub::new(hub_cfg(1000));
    let sat = Satellite::start(&hub, Environment::SATELLITE, 1).await;

    let (_h, mut hub_inbox) = listen(&hub.channels("ui"), "ping");
    let sat_channels = sat.conn.channels("ui");
    let (_s, mut sat_inbox) = listen(&sat_channels, "ping");

    sat_channels
        .channel("ping")
        .send(flags(Environment::SATELLITE, INCLUDE_LOCAL), json!("hi"))
        .await
        .unwrap();

    let got = next(&mut sat_inbox).await;
    assert_eq!(got.data, json!("hi"));
    assert_eq!(got.origin, Some(sat.id()));
    silent(&mut sat_inbox).await;
    silent(&mut hub_inbox).await;
}

#[tokio::test]
async fn peer_target_reaches_only_that_peer() {
    let hub = Hub::new(hub_cfg(1000));
    let a = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let b = Satellite::start(&hub, Environment::SATELLITE, 2).await;

    let (_h, mut hub_inbox) = listen(&hub.channels("rpc"), "call");
    let a_channels = a.conn.channels("rpc");
    let (_a, mut a_inbox) = listen(&a_channels, "call");
    let (_b, mut b_inbox) = listen(&b.conn.channels("rpc"), "call");

    a_channels.channel("call").send_to_peer(b.id(), json!({"n": 1})).await.unwrap();

    let got = next(&mut b_inbox).await;
    assert_eq!(got.data, json!({"n": 1}));
    assert_eq!(got.origin, Some(a.id()));
    silent(&mut a_inbox).await;
    silent(&mut hub_inbox).await;
    silent(&mut b_inbox).await;
}

#[tokio::test]
async fn grace_window_holds_then_expires() {
    let hub = Hub::new(hub_cfg(200));
    let b = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let b_id = b.id();
    let (_b, mut b_inbox) = listen(&b.conn.channels("sync"), "state");
    let hub_channel = hub.channels("sync").channel("state");

    // Disconnect and keep the hub unreachable for a while.
    b.link.set_reachable(false);
    b.link.sever();
    eventually(|| matches!(hub.peer_status(b_id), Some(PeerStatus::Pending { .. }))).await;

    hub_channel.send_to_peer(b_id, json!(1)).await.unwrap();
    assert_eq!(hub.peer_status(b_id), Some(PeerStatus::Pending { queued: 1 }));

    b.link.set_reachable(true);
    let got = next(&mut b_inbox).await;
    assert_eq!(got.data, json!(1));
    assert_eq!(got.origin, Some(hub.local_peer_id()));
    assert_eq!(b.id(), b_id, "record restored with the same identity");
    assert_eq!(hub.peer_status(b_id), Some(PeerStatus::Live));
    silent(&mut b_inbox).await;

    // Second outage outlives the window: the record goes away.
    b.link.set_reachable(false);
    b.link.sever();
    eventually(|| hub.peer_status(b_id).is_none()).await;

    hub_channel.send_to_peer(b_id, json!(2)).await.unwrap();
    b.link.set_reachable(true);
    assert!(b.conn.wait_for_phase(Phase::Connected, WAIT).await);
    assert_ne!(b.id(), b_id, "expired identity is not restored");
    silent(&mut b_inbox).await;
}

#[tokio::test]
async fn send_racing_a_transport_loss_is_delivered_once() {
    let hub = Hub::new(hub_cfg(1000));
    let b = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let b_id = b.id();
    let (_b, mut b_inbox) = listen(&b.conn.channels("sync"), "state");

    // No yield between the cut and the send: the hub has not seen the loss.
    b.link.set_reachable(false);
    b.link.sever();
    hub.channels("sync")
        .channel("state")
        .send_to_peer(b_id, json!("during-teardown"))
        .await
        .unwrap();

    b.link.set_reachable(true);
    assert_eq!(next(&mut b_inbox).await.data, json!("during-teardown"));
    assert!(b.conn.wait_for_phase(Phase::Connected, WAIT).await);
    assert_eq!(b.id(), b_id);
    silent(&mut b_inbox).await;
}

#[tokio::test]
async fn sends_while_disconnected_are_held_in_order() {
    let hub = Hub::new(hub_cfg(1000));
    let a = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let (_h, mut hub_inbox) = listen(&hub.channels("log"), "line");
    let a_channel = a.conn.channels("log").channel("line");

    a.link.set_reachable(false);
    a.link.sever();
    assert!(a.conn.wait_for_phase(Phase::Disconnected, WAIT).await);

    for i in 0..3 {
        a_channel.send_to_hub(json!(i)).await.unwrap();
    }
    assert_eq!(a.conn.pending_sends(), 3);

    a.link.set_reachable(true);
    for i in 0..3 {
        assert_eq!(next(&mut hub_inbox).await.data, json!(i));
    }
    assert_eq!(a.conn.pending_sends(), 0);
}

#[tokio::test]
async fn pause_then_keep_last_transmits_one_value() {
    let hub = Hub::new(hub_cfg(1000));
    let a = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let b = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let (_b, mut b_inbox) = listen(&b.conn.channels("ui"), "scroll");

    let channel = a.conn.channels("ui").channel("scroll");
    let resume = channel.pause();
    for y in [10, 20, 30] {
        channel.send_to_peer(b.id(), json!(y)).await.unwrap();
    }
    silent(&mut b_inbox).await;

    resume
        .resume_with(|mut values| values.pop().into_iter().collect())
        .await;

    assert_eq!(next(&mut b_inbox).await.data, json!(30));
    silent(&mut b_inbox).await;
}

#[tokio::test]
async fn farewell_removes_without_grace() {
    let hub = Hub::new(hub_cfg(60_000));
    let a = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let a_id = a.id();
    assert_eq!(hub.peer_count(), 1);

    a.conn.shutdown().await;
    eventually(|| hub.peer_status(a_id).is_none()).await;
    assert_eq!(a.conn.phase(), Phase::Disconnected);
}

#[tokio::test]
async fn tab_target_reaches_every_peer_in_the_tab() {
    let hub = Hub::new(hub_cfg(1000));
    let a = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let b = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let c = Satellite::start(&hub, Environment::SATELLITE, 2).await;
    assert_eq!(a.conn.tab_id(), 1);

    let (_a, mut a_inbox) = listen(&a.conn.channels("nav"), "go");
    let (_b, mut b_inbox) = listen(&b.conn.channels("nav"), "go");
    let (_c, mut c_inbox) = listen(&c.conn.channels("nav"), "go");

    hub.channels("nav").channel("go").send_to_tab(1, json!("/home")).await.unwrap();
    assert_eq!(next(&mut a_inbox).await.data, json!("/home"));
    assert_eq!(next(&mut b_inbox).await.data, json!("/home"));
    silent(&mut c_inbox).await;

    // A peer in the tab sees its own tab send once (locally), never echoed.
    a.conn.channels("nav").channel("go").send_to_tab(1, json!("/a")).await.unwrap();
    assert_eq!(next(&mut a_inbox).await.data, json!("/a"));
    assert_eq!(next(&mut b_inbox).await.data, json!("/a"));
    silent(&mut a_inbox).await;
    silent(&mut c_inbox).await;

    hub.channels("nav").channel("go").send_to_tab(NO_TAB, json!("x")).await.unwrap();
    silent(&mut a_inbox).await;
}

#[tokio::test]
async fn hub_is_addressable_by_id_and_by_flag() {
    let hub = Hub::new(hub_cfg(1000));
    let a = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let (_h, mut hub_inbox) = listen(&hub.channels("rpc"), "call");
    let channel = a.conn.channels("rpc").channel("call");

    channel.send_to_peer(hub.local_peer_id(), json!(1)).await.unwrap();
    channel.send_to_hub(json!(2)).await.unwrap();

    let first = next(&mut hub_inbox).await;
    assert_eq!(first.data, json!(1));
    assert_eq!(first.origin, Some(a.id()));
    assert_eq!(next(&mut hub_inbox).await.data, json!(2));
}

#[tokio::test]
async fn presentation_flags_resolve_at_the_receiver() {
    let hub = Hub::new(hub_cfg(1000));
    let focused = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let hidden = Satellite::start(&hub, Environment::SATELLITE, 2).await;
    focused.conn.set_presentation(Presentation {
        visible: true,
        focused: true,
    });

    let (_f, mut f_inbox) = listen(&focused.conn.channels("ui"), "toast");
    let (_x, mut x_inbox) = listen(&hidden.conn.channels("ui"), "toast");

    hub.channels("ui").channel("toast").send_to_focused(json!("saved")).await.unwrap();
    assert_eq!(next(&mut f_inbox).await.data, json!("saved"));
    silent(&mut x_inbox).await;
}

#[tokio::test]
async fn direct_link_bypasses_the_hub() {
    let hub = Hub::new(hub_cfg(1000));
    let env = Environment::SATELLITE | Environment::DIRECT_ACCESS;
    let a = Satellite::start(&hub, env, 3).await;
    let b = Satellite::start(&hub, env, 3).await;
    let (_b, mut b_inbox) = listen(&b.conn.channels("ui"), "frame");
    let a_channel = a.conn.channels("ui").channel("frame");

    // A relayed broadcast makes the hub broker a link between the pair.
    a_channel.send_to_satellites(json!("via hub")).await.unwrap();
    assert_eq!(next(&mut b_inbox).await.data, json!("via hub"));
    let b_id = b.id();
    eventually(|| a.conn.has_direct_link(b_id)).await;

    // With A cut off from the hub, a peer send still arrives over the link.
    a.link.set_reachable(false);
    a.link.sever();
    assert!(a.conn.wait_for_phase(Phase::Disconnected, WAIT).await);

    a_channel.send_to_peer(b_id, json!("direct")).await.unwrap();
    let got = next(&mut b_inbox).await;
    assert_eq!(got.data, json!("direct"));
    assert_eq!(got.origin, Some(a.id()));
    assert_eq!(a.conn.pending_sends(), 0);
    silent(&mut b_inbox).await;
}

#[tokio::test]
async fn no_direct_link_across_tabs() {
    let hub = Hub::new(hub_cfg(1000));
    let env = Environment::SATELLITE | Environment::DIRECT_ACCESS;
    let a = Satellite::start(&hub, env, 3).await;
    let b = Satellite::start(&hub, env, 4).await;
    let (_b, mut b_inbox) = listen(&b.conn.channels("ui"), "frame");

    a.conn.channels("ui").channel("frame").send_to_satellites(json!(1)).await.unwrap();
    next(&mut b_inbox).await;
    tokio::time::sleep(QUIET).await;
    assert!(!a.conn.has_direct_link(b.id()));
}

/// Wraps payloads on encode, unwraps on decode, counting both.
#[derive(Default)]
struct CountingCodec {
    encoded: AtomicUsize,
    decoded: AtomicUsize,
}

#[async_trait]
impl PayloadCodec for CountingCodec {
    async fn encode(&self, value: Value) -> Result<Value> {
        self.encoded.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "wrapped": value }))
    }

    async fn decode(&self, value: Value) -> Result<Value> {
        self.decoded.fetch_add(1, Ordering::SeqCst);
        Ok(value.get("wrapped").cloned().unwrap_or(Value::Null))
    }
}

#[tokio::test]
async fn payload_codec_runs_once_per_send_and_receive() {
    let hub = Hub::new(hub_cfg(1000));
    let codec_a = Arc::new(CountingCodec::default());
    let codec_b = Arc::new(CountingCodec::default());

    let link_a = Arc::new(MemoryConnector::new(hub.clone(), 1));
    let a = PeerConnector::with_codec(peer_cfg(1), Environment::SATELLITE, link_a, codec_a.clone());
    let link_b = Arc::new(MemoryConnector::new(hub.clone(), 1));
    let b = PeerConnector::with_codec(peer_cfg(1), Environment::SATELLITE, link_b, codec_b.clone());
    assert!(a.wait_for_phase(Phase::Connected, WAIT).await);
    assert!(b.wait_for_phase(Phase::Connected, WAIT).await);

    let (_b, mut b_inbox) = listen(&b.channels("rpc"), "call");
    let b_id = b.peer_id().unwrap();
    a.channels("rpc").channel("call").send_to_peer(b_id, json!({"q": 1})).await.unwrap();

    assert_eq!(next(&mut b_inbox).await.data, json!({"q": 1}));
    assert_eq!(codec_a.encoded.load(Ordering::SeqCst), 1);
    assert_eq!(codec_b.decoded.load(Ordering::SeqCst), 1);

    // Local short-circuit never touches the codec.
    a.channels("rpc").channel("call").send_local(json!(0)).await.unwrap();
    assert_eq!(codec_a.encoded.load(Ordering::SeqCst), 1);
}

/// Encodes untouched, refuses to decode anything.
struct RejectingCodec;

#[async_trait]
impl PayloadCodec for RejectingCodec {
    async fn encode(&self, value: Value) -> Result<Value> {
        Ok(value)
    }

    async fn decode(&self, _value: Value) -> Result<Value> {
        Err(RouteError::Codec("corrupt payload".into()))
    }
}

#[tokio::test]
async fn undecodable_payloads_never_reach_listeners() {
    let hub = Hub::with_codec(hub_cfg(1000), Arc::new(RejectingCodec));
    let a = Satellite::start(&hub, Environment::SATELLITE, 1).await;
    let link_b = Arc::new(MemoryConnector::new(hub.clone(), 1));
    let b = PeerConnector::with_codec(peer_cfg(1), Environment::SATELLITE, link_b, Arc::new(RejectingCodec));
    assert!(b.wait_for_phase(Phase::Connected, WAIT).await);

    let hub_channels = hub.channels("rpc");
    let (_h, mut hub_inbox) = listen(&hub_channels, "call");
    let (_b, mut b_inbox) = listen(&b.channels("rpc"), "call");

    let channel = a.conn.channels("rpc").channel("call");
    channel.send_to_hub(json!(1)).await.unwrap();
    channel.send_to_peer(b.peer_id().unwrap(), json!(2)).await.unwrap();
    hub_channels.channel("call").send_to_peer(b.peer_id().unwrap(), json!(3)).await.unwrap();

    silent(&mut hub_inbox).await;
    silent(&mut b_inbox).await;

    // Local delivery skips the codec, so the same listener still fires.
    hub_channels.channel("call").send_local(json!(4)).await.unwrap();
    assert_eq!(next(&mut hub_inbox).await.data, json!(4));
}
