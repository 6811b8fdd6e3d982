//! Pool reconciliation behavior against mock relays.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{eose, mock_client};
use nostr::{ClientMessage, Filter};
use nostr_mux::{ConnectionState, MuxConfig, MuxError, RelayEndpoint, ReqSource};
use tokio::time::timeout;

fn kind_filter(kind: u64) -> Filter {
    Filter {
        kinds: Some(vec![kind]),
        ..Default::default()
    }
}

#[tokio::test]
async fn switch_starts_and_stops_exactly_the_diff() {
    let (client, factory) = mock_client(MuxConfig::default());
    client
        .switch_relays([
            RelayEndpoint::new("wss://a.example.com"),
            RelayEndpoint::new("wss://b.example.com"),
        ])
        .await
        .expect("initial switch");

    let a = factory.get("wss://a.example.com/");
    let b = factory.get("wss://b.example.com/");
    assert_eq!(a.starts.load(Ordering::SeqCst), 1);
    assert_eq!(b.starts.load(Ordering::SeqCst), 1);

    client
        .switch_relays([
            RelayEndpoint::new("wss://b.example.com"),
            RelayEndpoint::new("wss://c.example.com"),
        ])
        .await
        .expect("second switch");

    let c = factory.get("wss://c.example.com/");
    assert_eq!(a.stops.load(Ordering::SeqCst), 1, "a left the readable set");
    assert_eq!(a.disposes.load(Ordering::SeqCst), 1, "a left the pool");
    assert_eq!(b.starts.load(Ordering::SeqCst), 1, "b kept its transport");
    assert_eq!(b.stops.load(Ordering::SeqCst), 0);
    assert_eq!(c.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_urls_collapse_to_one_record() {
    let (client, factory) = mock_client(MuxConfig::default());
    client
        .switch_relays([
            RelayEndpoint::read_only("wss://a.example.com"),
            RelayEndpoint::new("wss://A.example.com/"),
        ])
        .await
        .expect("switch");

    assert_eq!(factory.created_count(), 1);
    // last-wins: the second entry turned the relay writable
    let relay = factory.get("wss://a.example.com/");
    assert_eq!(relay.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn added_relay_receives_live_forward_reqs() {
    let (client, factory) = mock_client(MuxConfig::default());
    client
        .add_relay(RelayEndpoint::new("wss://a.example.com"))
        .await
        .expect("add first relay");
    let a = factory.get("wss://a.example.com/");

    let (source, emitter) = ReqSource::forward("sub");
    let _events = client.subscribe(source).await.expect("subscribe");
    emitter.emit(vec![kind_filter(1)]);
    let frames = a.wait_for_frames(1).await;
    let req = frames[0].clone();
    assert_eq!(req, ClientMessage::req("sub:0", vec![kind_filter(1)]));

    client
        .add_relay(RelayEndpoint::new("wss://b.example.com"))
        .await
        .expect("add second relay");
    let b = factory.get("wss://b.example.com/");

    // the newcomer gets the most recent REQ exactly once
    let frames = b.wait_for_frames(1).await;
    assert_eq!(frames[0], req);
    b.assert_no_more_frames(1).await;
    a.assert_no_more_frames(1).await;
}

#[tokio::test]
async fn dropped_relay_gets_closes_before_stop() {
    let (client, factory) = mock_client(MuxConfig::default());
    client
        .add_relay(RelayEndpoint::new("wss://a.example.com"))
        .await
        .expect("add relay");
    let a = factory.get("wss://a.example.com/");

    let (source, emitter) = ReqSource::forward("sub");
    let _events = client.subscribe(source).await.expect("subscribe");
    emitter.emit(vec![kind_filter(1)]);
    a.wait_for_frames(1).await;

    client
        .remove_relay("wss://a.example.com")
        .await
        .expect("remove relay");

    let frames = a.wait_for_frames(2).await;
    assert_eq!(frames[1], ClientMessage::close("sub:0"));
    assert_eq!(a.stops.load(Ordering::SeqCst), 1);
    assert_eq!(a.disposes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn backward_completion_treats_terminal_relays_as_drained() {
    let (client, factory) = mock_client(MuxConfig::default());
    client
        .switch_relays([
            RelayEndpoint::new("wss://a.example.com"),
            RelayEndpoint::new("wss://b.example.com"),
        ])
        .await
        .expect("switch");
    let a = factory.get("wss://a.example.com/");
    let b = factory.get("wss://b.example.com/");

    let source = ReqSource::oneshot("sub", vec![kind_filter(1)]);
    let mut events = client.subscribe(source).await.expect("subscribe");
    a.wait_for_frames(1).await;
    b.wait_for_frames(1).await;

    a.push(eose("sub:0"));
    // a has drained, b never answers but dies; completion follows
    b.set_state(ConnectionState::Error).await;

    let done = timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("stream completes");
    assert!(done.is_none());
}

#[tokio::test]
async fn terminal_failure_clears_active_subscriptions() {
    let (client, factory) = mock_client(MuxConfig::default());
    client
        .add_relay(RelayEndpoint::new("wss://a.example.com"))
        .await
        .expect("add relay");
    let a = factory.get("wss://a.example.com/");

    let (source, emitter) = ReqSource::forward("sub");
    let events = client.subscribe(source).await.expect("subscribe");
    emitter.emit(vec![kind_filter(1)]);
    a.wait_for_frames(1).await;

    a.set_state(ConnectionState::Error).await;
    a.push_error("giving up after 10 reconnect attempts");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the dead relay holds no active ids, so unsubscribing sends nothing
    drop(events);
    a.assert_no_more_frames(1).await;
}

#[tokio::test]
async fn transport_errors_surface_on_the_error_aggregator() {
    let (client, factory) = mock_client(MuxConfig::default());
    let mut errors = client.all_errors();
    client
        .add_relay(RelayEndpoint::new("wss://a.example.com"))
        .await
        .expect("add relay");
    let a = factory.get("wss://a.example.com/");

    a.push_error("giving up after 10 reconnect attempts");

    let packet = timeout(Duration::from_secs(1), errors.recv())
        .await
        .expect("error delivered")
        .expect("aggregator open");
    assert_eq!(packet.from, "wss://a.example.com/");
    assert!(packet.reason.contains("giving up"));
}

#[tokio::test]
async fn connection_state_transitions_are_aggregated() {
    let (client, factory) = mock_client(MuxConfig::default());
    let mut states = client.connection_states();
    client
        .add_relay(RelayEndpoint::new("wss://a.example.com"))
        .await
        .expect("add relay");

    let packet = timeout(Duration::from_secs(1), states.recv())
        .await
        .expect("transition delivered")
        .expect("aggregator open");
    assert_eq!(packet.from, "wss://a.example.com/");
    assert_eq!(packet.state, ConnectionState::Ongoing);

    factory
        .get("wss://a.example.com/")
        .set_state(ConnectionState::Reconnecting)
        .await;
    let packet = timeout(Duration::from_secs(1), states.recv())
        .await
        .expect("transition delivered")
        .expect("aggregator open");
    assert_eq!(packet.state, ConnectionState::Reconnecting);
}

#[tokio::test]
async fn relay_state_lookup_normalizes_and_rejects_unknown() {
    let (client, _factory) = mock_client(MuxConfig::default());
    client
        .add_relay(RelayEndpoint::new("wss://a.example.com"))
        .await
        .expect("add relay");

    let state = client
        .relay_state("wss://A.example.com")
        .await
        .expect("known relay");
    assert_eq!(state, ConnectionState::Ongoing);

    assert!(matches!(
        client.relay_state("wss://unknown.example.com").await,
        Err(MuxError::UnknownRelay(_))
    ));
}

#[tokio::test]
async fn dispose_is_idempotent_and_makes_operations_noops() {
    let (client, factory) = mock_client(MuxConfig::default());
    client
        .add_relay(RelayEndpoint::new("wss://a.example.com"))
        .await
        .expect("add relay");
    let a = factory.get("wss://a.example.com/");

    client.dispose().await;
    client.dispose().await;
    assert_eq!(a.disposes.load(Ordering::SeqCst), 1);

    // pool mutations become no-ops
    client
        .add_relay(RelayEndpoint::new("wss://b.example.com"))
        .await
        .expect("no-op add");
    assert_eq!(factory.created_count(), 1);

    // bindings are refused and fan-in streams are complete
    let (source, _emitter) = ReqSource::forward("sub");
    assert!(matches!(
        client.subscribe(source).await,
        Err(MuxError::Disposed)
    ));
    let mut messages = client.all_messages();
    assert!(matches!(
        messages.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Closed)
    ));
}
