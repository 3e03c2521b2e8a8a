//! End-to-end sessions through the WebSocket relay.
//!
//! These tests start a real relay on a free port and connect real
//! transports, verifying the full pipeline.

use std::sync::Arc;
use std::time::Duration;

use quill_collab::{
    ChannelEvent, CollabConfig, CollabSession, ConnectionState, FieldBinding, FocusOutcome, LocalUser,
    RelayConfig, RelayServer, RelayTransport, Resolution, SessionId, Transport,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{timeout, Instant};

/// Start a relay on a free port, return it and its URL.
async fn start_relay(config: RelayConfig) -> (Arc<RelayServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(RelayServer::new(config));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, url)
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn session(url: &str, user: LocalUser) -> (RelayTransport, Arc<CollabSession>) {
    let transport = RelayTransport::connect(url).await.unwrap();
    let session = Arc::new(CollabSession::join(
        &transport,
        SessionId::article("7"),
        user,
        CollabConfig::default(),
    ));
    (transport, session)
}

#[tokio::test]
async fn test_subscribe_reports_subscribed_then_presence() {
    let (_server, url) = start_relay(RelayConfig::default()).await;
    let transport = RelayTransport::connect(url.as_str()).await.unwrap();
    assert_eq!(transport.connection_state(), ConnectionState::Connected);

    let mut channel = transport.subscribe("article:7:locks", "u-1").unwrap();
    let first = timeout(Duration::from_secs(1), channel.recv()).await.unwrap();
    assert_eq!(first, Some(ChannelEvent::Subscribed));
    let second = timeout(Duration::from_secs(1), channel.recv()).await.unwrap();
    assert!(matches!(second, Some(ChannelEvent::PresenceSync(s)) if s.is_empty()));
    assert_eq!(transport.subscription_count(), 1);
}

#[tokio::test]
async fn test_presence_locks_and_updates_cross_the_relay() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let (_ta, a) = session(&url, LocalUser::new("u-ann", "ann@example.com")).await;
    let (_tb, b) = session(&url, LocalUser::new("u-bob", "bob@example.com")).await;

    eventually("presence", || a.active_users().len() == 1 && b.active_users().len() == 1).await;
    assert_eq!(a.active_users()[0].user_email, "bob@example.com");

    let title = a.handle("title");
    assert_eq!(title.focus(), FocusOutcome::Editing);
    eventually("lock", || b.is_field_locked("title")).await;
    assert!(matches!(b.handle("title").focus(), FocusOutcome::ReadOnly { holder: Some(h) } if h.user_id == "u-ann"));

    title.input(json!("Relay title"));
    eventually("update", || b.field_value("title") == Some(json!("Relay title"))).await;

    title.blur(json!("Relay title, final"));
    eventually("unlock", || !b.is_field_locked("title")).await;
    assert_eq!(b.field_value("title"), Some(json!("Relay title, final")));

    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.active_rooms, 3);
    assert!(stats.total_frames > 0);
}

#[tokio::test]
async fn test_conflict_over_the_relay() {
    let (_server, url) = start_relay(RelayConfig::default()).await;
    let (_ta, a) = session(&url, LocalUser::new("u-ann", "ann@example.com")).await;
    let (_tb, b) = session(&url, LocalUser::new("u-bob", "bob@example.com")).await;
    eventually("presence", || a.active_users().len() == 1).await;

    let summary = b.handle("summary");
    summary.focus();
    summary.input(json!("Bob's summary"));
    eventually("bob's value", || a.field_value("summary").is_some()).await;

    a.broadcast_field_update("summary", json!("Ann's summary"));
    eventually("pending", || b.pending_update("summary").is_some()).await;
    assert_eq!(b.field_value("summary"), Some(json!("Bob's summary")));

    assert!(summary.resolve(Resolution::KeepMine));
    eventually("kept value", || a.field_value("summary") == Some(json!("Bob's summary"))).await;
}

#[tokio::test]
async fn test_closing_a_session_withdraws_it() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let (ta, a) = session(&url, LocalUser::new("u-ann", "ann@example.com")).await;
    let (_tb, b) = session(&url, LocalUser::new("u-bob", "bob@example.com")).await;
    eventually("presence", || b.active_users().len() == 1).await;

    assert!(a.lock_field("title"));
    eventually("lock", || b.is_field_locked("title")).await;

    a.close();
    eventually("unlock", || !b.is_field_locked("title")).await;
    eventually("leave", || b.active_users().is_empty()).await;
    eventually("unsubscribe", || ta.subscription_count() == 0).await;

    drop(b);
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.stats().await.active_rooms > 0 {
        assert!(Instant::now() < deadline, "rooms were not cleaned up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_subscription_limit_is_enforced() {
    let config = RelayConfig {
        max_subscriptions: 2,
        ..RelayConfig::default()
    };
    let (server, url) = start_relay(config).await;
    let transport = RelayTransport::connect(url.as_str()).await.unwrap();

    let mut first = transport.subscribe("t:1", "u-1").unwrap();
    let mut second = transport.subscribe("t:2", "u-1").unwrap();
    let mut third = transport.subscribe("t:3", "u-1").unwrap();

    for channel in [&mut first, &mut second] {
        let event = timeout(Duration::from_secs(1), channel.recv()).await.unwrap();
        assert_eq!(event, Some(ChannelEvent::Subscribed));
    }
    let refused = timeout(Duration::from_secs(1), third.recv()).await.unwrap();
    assert!(matches!(refused, Some(ChannelEvent::Closed { reason }) if reason.contains("limit")));
    assert_eq!(server.rooms().room_count().await, 2);
    assert_eq!(transport.subscription_count(), 2);
}

#[tokio::test]
async fn test_refused_channel_takes_session_offline() {
    let config = RelayConfig {
        max_subscriptions: 2,
        ..RelayConfig::default()
    };
    let (_server, url) = start_relay(config).await;
    let (transport, session) = session(&url, LocalUser::new("u-ann", "ann@example.com")).await;

    eventually("offline", || !session.is_online()).await;
    assert_eq!(transport.connection_state(), ConnectionState::Connected);
    assert!(session.lock_field("title"));
}

#[tokio::test]
async fn test_lost_relay_closes_channels() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    // A relay that accepts one socket and hangs up straight away.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(ws);
    });

    let transport = RelayTransport::connect(url.as_str()).await.unwrap();
    let session = CollabSession::join(
        &transport,
        SessionId::draft(),
        LocalUser::new("u-ann", "ann@example.com"),
        CollabConfig::default(),
    );

    eventually("disconnect", || transport.connection_state() == ConnectionState::Disconnected).await;
    eventually("offline", || !session.is_online()).await;
    assert!(session.lock_field("title"));
    assert!(transport.subscribe("article:x:locks", "u-ann").is_err());
}
