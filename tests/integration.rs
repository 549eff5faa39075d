//! End-to-end happy paths: subscribe, connect, typed dispatch, multiplexing.

mod common;

use common::{MockTransport, wait_until};
use crossbeam_channel::unbounded;
use realtime_channels::{
    ChangeEventKind, ChangeInterest, ChannelConfig, ChannelManager, ChannelMessage, ChannelState,
    ChangePayload, OutboundMessage, PresenceCallbacks, Transport, TransportStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn manager_with(transport: &Arc<MockTransport>) -> ChannelManager {
    ChannelManager::new(Arc::clone(transport) as Arc<dyn Transport>)
}

fn quiet_config() -> ChannelConfig {
    ChannelConfig {
        heartbeat_interval: Duration::from_secs(3600),
        ..ChannelConfig::default()
    }
}

fn insert_message(table: &str) -> ChannelMessage {
    ChannelMessage::ChangeInsert {
        change: ChangePayload {
            schema: "public".into(),
            table: table.into(),
            commit_timestamp: Some("2026-08-25T12:00:00Z".into()),
            new: Some(json!({"id": 1})),
            old: None,
        },
    }
}

#[test]
fn subscribe_connect_and_receive_changes() {
    let transport = MockTransport::new();
    let manager = manager_with(&transport);
    let (tx, rx) = unbounded();

    let guard = manager
        .subscribe_to_changes(
            "rows:db42",
            ChangeInterest::new(
                ChangeEventKind::All,
                Arc::new(move |msg| {
                    tx.send(msg.clone()).unwrap();
                }),
            )
            .with_table("rows"),
            quiet_config(),
        )
        .unwrap();

    // Channel goes straight into the handshake.
    assert_eq!(
        manager.channel_state("rows:db42"),
        Some(ChannelState::Connecting)
    );

    let handle = transport.latest();
    handle.emit_status(TransportStatus::Subscribed);
    assert_eq!(
        manager.channel_state("rows:db42"),
        Some(ChannelState::Connected)
    );

    assert_eq!(handle.deliver(&insert_message("rows")), 1);
    let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
    assert!(matches!(received, ChannelMessage::ChangeInsert { .. }));

    // Non-matching table never reaches the callback.
    assert_eq!(handle.deliver(&insert_message("other")), 0);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    guard.dispose();
}

#[test]
fn overlapping_interests_share_one_handle() {
    let transport = MockTransport::new();
    let manager = manager_with(&transport);

    let a = manager
        .subscribe_to_changes(
            "rows:db42",
            ChangeInterest::new(ChangeEventKind::Insert, Arc::new(|_| {})),
            quiet_config(),
        )
        .unwrap();
    let b = manager
        .subscribe_to_changes(
            "rows:db42",
            ChangeInterest::new(ChangeEventKind::Delete, Arc::new(|_| {})),
            quiet_config(),
        )
        .unwrap();
    let c = manager
        .subscribe_to_presence("other:key", PresenceCallbacks::default(), quiet_config())
        .unwrap();

    // One connection per key, not per interest.
    assert_eq!(transport.open_count(), 2);
    assert_eq!(transport.latest_for("rows:db42").binding_count(), 2);
    assert_eq!(manager.channel_count(), 2);

    a.dispose();
    b.dispose();
    c.dispose();
}

#[test]
fn presence_callbacks_receive_sync_and_join() {
    let transport = MockTransport::new();
    let manager = manager_with(&transport);
    let (sync_tx, sync_rx) = unbounded();
    let (join_tx, join_rx) = unbounded();

    let guard = manager
        .subscribe_to_presence(
            "room:1",
            PresenceCallbacks {
                on_sync: Some(Arc::new(move |state| {
                    sync_tx.send(state.len()).unwrap();
                })),
                on_join: Some(Arc::new(move |key, joins| {
                    join_tx.send((key.to_string(), joins.len())).unwrap();
                })),
                on_leave: None,
            },
            quiet_config(),
        )
        .unwrap();

    let handle = transport.latest();
    handle.emit_status(TransportStatus::Subscribed);

    let mut state = realtime_channels::PresenceState::new();
    state.insert("user-1".into(), vec![json!({"cursor": 4})]);
    handle.deliver(&ChannelMessage::PresenceSync { state });
    handle.deliver(&ChannelMessage::PresenceJoin {
        key: "user-2".into(),
        joins: vec![json!({"cursor": 0})],
    });

    assert_eq!(sync_rx.recv_timeout(Duration::from_millis(100)).unwrap(), 1);
    assert_eq!(
        join_rx.recv_timeout(Duration::from_millis(100)).unwrap(),
        ("user-2".into(), 1)
    );

    guard.dispose();
}

#[test]
fn broadcast_round_trip() {
    let transport = MockTransport::new();
    let manager = manager_with(&transport);
    let (tx, rx) = unbounded();

    let guard = manager
        .subscribe_to_broadcast(
            "room:1",
            "cursor",
            Arc::new(move |msg| {
                tx.send(msg.clone()).unwrap();
            }),
            quiet_config(),
        )
        .unwrap();

    let handle = transport.latest();
    handle.emit_status(TransportStatus::Subscribed);

    // Incoming ping with the right event name is dispatched...
    handle.deliver(&ChannelMessage::Broadcast {
        event: "cursor".into(),
        payload: json!({"x": 10}),
    });
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_ok());

    // ...a different event name is not.
    handle.deliver(&ChannelMessage::Broadcast {
        event: "typing".into(),
        payload: json!({}),
    });
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    // Outbound broadcast goes through the same handle.
    manager
        .send_broadcast("room:1", "cursor", json!({"x": 11}))
        .unwrap();
    let sent = handle.sent.lock();
    assert!(sent
        .iter()
        .any(|m| matches!(m, OutboundMessage::Broadcast { event, .. } if event == "cursor")));
    drop(sent);

    guard.dispose();
}

#[test]
fn get_channel_reuses_and_counts() {
    let transport = MockTransport::new();
    let manager = manager_with(&transport);

    let first = manager.get_channel("rows:db42", quiet_config()).unwrap();
    let second = manager.get_channel("rows:db42", quiet_config()).unwrap();
    assert_eq!(transport.open_count(), 1);
    assert!(Arc::ptr_eq(&first, &second));

    // get_channel alone never initiates the handshake.
    assert_eq!(manager.channel_state("rows:db42"), Some(ChannelState::Idle));
}

#[test]
fn stats_reflect_registry_contents() {
    let transport = MockTransport::new();
    let manager = manager_with(&transport);

    let a = manager
        .subscribe_to_changes(
            "a",
            ChangeInterest::new(ChangeEventKind::All, Arc::new(|_| {})),
            quiet_config(),
        )
        .unwrap();
    transport.latest_for("a").emit_status(TransportStatus::Subscribed);
    let b = manager
        .subscribe_to_broadcast("b", "ping", Arc::new(|_| {}), quiet_config())
        .unwrap();

    let stats = manager.stats();
    assert_eq!(stats.channels, 2);
    assert_eq!(stats.subscriptions, 2);
    assert_eq!(stats.connected, 1);
    assert_eq!(stats.recovering, 1);
    assert_eq!(stats.errored, 0);

    a.dispose();
    b.dispose();

    manager.destroy_all();
    assert!(wait_until(Duration::from_millis(200), || {
        manager.channel_count() == 0
    }));
}
