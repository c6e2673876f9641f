//! Shared helpers for end-to-end relay tests.

#![allow(dead_code)]

use snippet_relay::{RelayClient, RelayEvent, RelayServer, ServerConfig, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL.
pub async fn start_test_server() -> String {
    start_server_with(|_| {}).await
}

/// Start a server with adjusted configuration, return its URL.
pub async fn start_server_with(adjust: impl FnOnce(&mut ServerConfig)) -> String {
    let port = free_port().await;
    let mut config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        outbound_capacity: 64,
        ..ServerConfig::default()
    };
    adjust(&mut config);
    let server = RelayServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

/// Connect a client, draining the initial Connected event.
pub async fn connect_client(url: &str) -> (RelayClient, mpsc::Receiver<RelayEvent>) {
    let mut client = RelayClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(1), events.recv()).await {
        Ok(Some(RelayEvent::Connected)) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    (client, events)
}

/// Connect and join `session_id` as `user_id`, returning the effective id.
///
/// Drains everything up to and including the joiner's first `session_info`.
pub async fn join(
    url: &str,
    session_id: &str,
    user_id: Option<&str>,
) -> (RelayClient, mpsc::Receiver<RelayEvent>, String) {
    let (client, mut events) = connect_client(url).await;
    client.join_session(session_id, user_id).await.unwrap();
    let effective = match next_message(&mut events).await {
        ServerMessage::JoinedSession { user_id, .. } => user_id,
        other => panic!("Expected JoinedSession, got {other:?}"),
    };
    wait_for(&mut events, |m| matches!(m, ServerMessage::SessionInfo { .. })).await;
    (client, events, effective)
}

/// Next relay message, failing after two seconds.
pub async fn next_message(events: &mut mpsc::Receiver<RelayEvent>) -> ServerMessage {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(RelayEvent::Message(msg))) => return msg,
            Ok(Some(RelayEvent::Connected)) => continue,
            other => panic!("Expected a relay message, got {other:?}"),
        }
    }
}

/// Skip messages until one matches `pred`.
pub async fn wait_for(
    events: &mut mpsc::Receiver<RelayEvent>,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    loop {
        let msg = next_message(events).await;
        if pred(&msg) {
            return msg;
        }
    }
}

/// Wait for the Disconnected event, skipping messages.
pub async fn wait_disconnected(events: &mut mpsc::Receiver<RelayEvent>) {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(RelayEvent::Disconnected)) => return,
            Ok(Some(_)) => continue,
            other => panic!("Expected Disconnected, got {other:?}"),
        }
    }
}

/// Drain pending events without blocking past `ms` of silence.
pub async fn drain(events: &mut mpsc::Receiver<RelayEvent>, ms: u64) -> Vec<RelayEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(evt)) = timeout(Duration::from_millis(ms), events.recv()).await {
        seen.push(evt);
    }
    seen
}

/// Create a session through a throwaway connection.
pub async fn create_session(url: &str, session_id: &str) {
    let (mut client, mut events) = connect_client(url).await;
    client.create_session(session_id).await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::SessionCreated { session_id: created } => assert_eq!(created, session_id),
        other => panic!("Expected SessionCreated, got {other:?}"),
    }
    client.close().await;
}
