//! Per-connection protocol state machine.
//!
//! ```text
//!            create_session            code_change / cursor_position /
//!            ┌──────┐                  code_execution / create_session
//!            ▼      │                  ┌──────┐
//!         Unbound ──┘── join_session ─▶ Bound ──┘
//!            │                           │
//!            └────── close ──▶ terminal ◀┘ (leave + presence)
//! ```
//!
//! The handler never touches the socket. Every reply goes through the
//! connection's own outbound queue so replies and broadcasts to this
//! connection keep one FIFO order.

use std::sync::Arc;

use serde_json::Value;

use crate::broadcast::Broadcaster;
use crate::connection::ConnectionHandle;
use crate::error::RelayError;
use crate::presence::PresenceNotifier;
use crate::protocol::{ClientMessage, ServerMessage};

/// Membership state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerState {
    /// Connected, not yet a member of any session.
    Unbound,
    /// Joined exactly one session as exactly one user.
    Bound { session_id: String, user_id: String },
    /// Connection closed; membership released.
    Closed,
}

pub struct ConnectionHandler {
    connection: ConnectionHandle,
    broadcaster: Arc<Broadcaster>,
    state: HandlerState,
}

impl ConnectionHandler {
    pub fn new(connection: ConnectionHandle, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            connection,
            broadcaster,
            state: HandlerState::Unbound,
        }
    }

    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    /// Process one inbound text frame.
    ///
    /// Recoverable errors are answered with an `error` frame on this
    /// connection and otherwise change nothing.
    pub async fn handle_frame(&mut self, text: &str) {
        let result = match ClientMessage::decode(text) {
            Ok(msg) => {
                log::debug!("Received {} from {}", msg.kind(), self.connection.id());
                self.handle_message(msg).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.reject(&e);
        }
    }

    /// Answer a bad frame with an `error` reply; state is left unchanged.
    pub fn reject(&self, err: &RelayError) {
        log::warn!("Rejected frame from {}: {err}", self.connection.id());
        self.reply(&ServerMessage::error(err));
    }

    /// Dispatch one parsed message.
    pub async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), RelayError> {
        match msg {
            ClientMessage::CreateSession { session_id } => self.create_session(session_id).await,
            ClientMessage::JoinSession {
                session_id,
                user_id,
            } => self.join_session(session_id, user_id).await,
            ClientMessage::CodeChange { code, cursor } => {
                self.code_change(code, cursor).await;
                Ok(())
            }
            ClientMessage::CursorPosition { position } => {
                self.cursor_position(position).await;
                Ok(())
            }
            ClientMessage::CodeExecution { output } => {
                self.code_execution(output).await;
                Ok(())
            }
        }
    }

    /// Release membership. Safe to call more than once.
    pub async fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, HandlerState::Closed);
        let HandlerState::Bound { session_id, .. } = state else {
            return;
        };
        let presence = PresenceNotifier::new(&self.broadcaster);
        self.broadcaster
            .registry()
            .leave_with(&session_id, self.connection.id(), |outcome, view| {
                presence.member_left(view, outcome)
            })
            .await;
    }

    async fn create_session(&mut self, session_id: String) -> Result<(), RelayError> {
        self.broadcaster.registry().create(&session_id).await?;
        self.reply(&ServerMessage::SessionCreated { session_id });
        Ok(())
    }

    async fn join_session(
        &mut self,
        session_id: String,
        user_id: Option<String>,
    ) -> Result<(), RelayError> {
        if !matches!(self.state, HandlerState::Unbound) {
            return Err(RelayError::MalformedMessage(
                "Already joined a session.".to_string(),
            ));
        }

        // The reply and presence frames are queued before any later change
        // to the session can reach this connection.
        let presence = PresenceNotifier::new(&self.broadcaster);
        let joined = self
            .broadcaster
            .registry()
            .join_with(
                &session_id,
                user_id.as_deref(),
                self.connection.clone(),
                |joined, view| {
                    self.reply(&ServerMessage::JoinedSession {
                        session_id: view.session_id().to_string(),
                        user_id: joined.user_id.clone(),
                        current_code: joined.current_code.clone(),
                    });
                    presence.member_joined(view, &joined.user_id, self.connection.id());
                },
            )
            .await?;

        self.state = HandlerState::Bound {
            session_id,
            user_id: joined.user_id,
        };
        Ok(())
    }

    async fn code_change(&mut self, code: String, cursor: Option<Value>) {
        let Some((session_id, user_id)) = self.binding() else {
            return;
        };
        let update = ServerMessage::CodeUpdate {
            code: code.clone(),
            user_id,
            cursor,
        };
        self.broadcaster
            .registry()
            .set_code_with(&session_id, &code, |view| {
                self.broadcaster
                    .deliver(view.connections(), &update, Some(self.connection.id()));
            })
            .await;
    }

    async fn cursor_position(&mut self, position: Value) {
        let Some((session_id, user_id)) = self.binding() else {
            return;
        };
        let update = ServerMessage::CursorUpdate { user_id, position };
        self.broadcaster
            .broadcast(&session_id, &update, Some(self.connection.id()))
            .await;
    }

    /// Execution results go to every member, the sender included.
    async fn code_execution(&mut self, output: Value) {
        let Some((session_id, user_id)) = self.binding() else {
            return;
        };
        let result = ServerMessage::ExecutionResult { output, user_id };
        self.broadcaster.broadcast(&session_id, &result, None).await;
    }

    fn binding(&self) -> Option<(String, String)> {
        match &self.state {
            HandlerState::Bound {
                session_id,
                user_id,
            } => Some((session_id.clone(), user_id.clone())),
            _ => None,
        }
    }

    fn reply(&self, msg: &ServerMessage) {
        if !self.broadcaster.send_to(&self.connection, msg) {
            log::warn!("Could not queue reply to {}", self.connection.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbox;
    use crate::registry::SessionRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Peer {
        handler: ConnectionHandler,
        outbox: Outbox,
    }

    impl Peer {
        fn new(broadcaster: &Arc<Broadcaster>) -> Self {
            let (conn, outbox) = ConnectionHandle::channel(32);
            Self {
                handler: ConnectionHandler::new(conn, broadcaster.clone()),
                outbox,
            }
        }

        async fn send(&mut self, frame: serde_json::Value) {
            self.handler.handle_frame(&frame.to_string()).await;
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Some(frame) = self.outbox.try_recv() {
                out.push(ServerMessage::decode(&frame).unwrap());
            }
            out
        }
    }

    fn broadcaster() -> Arc<Broadcaster> {
        Arc::new(Broadcaster::new(Arc::new(SessionRegistry::new())))
    }

    fn error(message: &str) -> ServerMessage {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    #[tokio::test]
    async fn test_create_does_not_bind() {
        let b = broadcaster();
        let mut x = Peer::new(&b);
        x.send(json!({"type": "create_session", "sessionId": "abcd"})).await;
        assert_eq!(
            x.drain(),
            vec![ServerMessage::SessionCreated {
                session_id: "abcd".into()
            }]
        );
        assert_eq!(x.handler.state(), &HandlerState::Unbound);

        x.send(json!({"type": "create_session", "sessionId": "abcd"})).await;
        assert_eq!(x.drain(), vec![error("Session already exists.")]);
    }

    #[tokio::test]
    async fn test_join_binds_and_replies_with_code() {
        let b = broadcaster();
        let mut x = Peer::new(&b);
        x.send(json!({"type": "create_session", "sessionId": "abcd"})).await;
        x.send(json!({"type": "join_session", "sessionId": "abcd", "userId": "u1"}))
            .await;

        let msgs = x.drain();
        assert_eq!(
            msgs[1],
            ServerMessage::JoinedSession {
                session_id: "abcd".into(),
                user_id: "u1".into(),
                current_code: String::new(),
            }
        );
        assert!(matches!(
            msgs[2],
            ServerMessage::SessionInfo { connected_users: 1, .. }
        ));
        assert_eq!(
            x.handler.state(),
            &HandlerState::Bound {
                session_id: "abcd".into(),
                user_id: "u1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_join_errors_keep_state() {
        let b = broadcaster();
        let mut x = Peer::new(&b);
        x.send(json!({"type": "join_session", "sessionId": "nope"})).await;
        assert_eq!(x.drain(), vec![error("Session does not exist.")]);
        assert_eq!(x.handler.state(), &HandlerState::Unbound);

        b.registry().create("abcd").await.unwrap();
        let mut y = Peer::new(&b);
        y.send(json!({"type": "join_session", "sessionId": "abcd", "userId": "dup"}))
            .await;
        x.send(json!({"type": "join_session", "sessionId": "abcd", "userId": "dup"}))
            .await;
        assert_eq!(
            x.drain(),
            vec![error("User already connected in this session.")]
        );
        assert_eq!(x.handler.state(), &HandlerState::Unbound);
    }

    #[tokio::test]
    async fn test_second_join_rejected() {
        let b = broadcaster();
        b.registry().create("one").await.unwrap();
        b.registry().create("two").await.unwrap();
        let mut x = Peer::new(&b);
        x.send(json!({"type": "join_session", "sessionId": "one", "userId": "u1"}))
            .await;
        x.drain();
        x.send(json!({"type": "join_session", "sessionId": "two", "userId": "u1"}))
            .await;
        assert_eq!(x.drain(), vec![error("Already joined a session.")]);
        assert!(b.registry().list_members("two").await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames() {
        let b = broadcaster();
        let mut x = Peer::new(&b);
        x.handler.handle_frame("{ not json").await;
        x.send(json!({"type": "teleport"})).await;
        assert_eq!(
            x.drain(),
            vec![
                error("Invalid message format"),
                error("Unknown message type: teleport")
            ]
        );
        assert_eq!(x.handler.state(), &HandlerState::Unbound);
    }

    #[tokio::test]
    async fn test_unbound_edits_ignored() {
        let b = broadcaster();
        let mut x = Peer::new(&b);
        x.send(json!({"type": "code_change", "code": "x"})).await;
        x.send(json!({"type": "cursor_position", "position": 1})).await;
        x.send(json!({"type": "code_execution", "output": "1"})).await;
        assert!(x.drain().is_empty());
    }

    #[tokio::test]
    async fn test_scenario_code_change_fanout() {
        let b = broadcaster();
        let mut x = Peer::new(&b);
        let mut y = Peer::new(&b);
        x.send(json!({"type": "create_session", "sessionId": "abcd"})).await;
        x.send(json!({"type": "join_session", "sessionId": "abcd", "userId": "u1"}))
            .await;
        y.send(json!({"type": "join_session", "sessionId": "abcd", "userId": "u2"}))
            .await;

        let y_msgs = y.drain();
        assert_eq!(
            y_msgs[0],
            ServerMessage::JoinedSession {
                session_id: "abcd".into(),
                user_id: "u2".into(),
                current_code: String::new(),
            }
        );
        assert!(matches!(
            y_msgs[1],
            ServerMessage::SessionInfo { connected_users: 2, .. }
        ));
        let x_msgs = x.drain();
        assert!(x_msgs.contains(&ServerMessage::user_joined("u2")));
        assert!(matches!(
            x_msgs.last(),
            Some(ServerMessage::SessionInfo { connected_users: 2, .. })
        ));

        x.send(json!({"type": "code_change", "code": "print(1)"})).await;
        assert_eq!(
            y.drain(),
            vec![ServerMessage::CodeUpdate {
                code: "print(1)".into(),
                user_id: "u1".into(),
                cursor: None,
            }]
        );
        assert!(x.drain().is_empty(), "sender must not see its own code_update");
        assert_eq!(b.registry().code("abcd").await.as_deref(), Some("print(1)"));
    }

    #[tokio::test]
    async fn test_cursor_excludes_sender_execution_includes_sender() {
        let b = broadcaster();
        b.registry().create("s").await.unwrap();
        let mut x = Peer::new(&b);
        let mut y = Peer::new(&b);
        x.send(json!({"type": "join_session", "sessionId": "s", "userId": "x"})).await;
        y.send(json!({"type": "join_session", "sessionId": "s", "userId": "y"})).await;
        x.drain();
        y.drain();

        x.send(json!({"type": "cursor_position", "position": {"line": 2}})).await;
        assert!(x.drain().is_empty());
        assert_eq!(
            y.drain(),
            vec![ServerMessage::CursorUpdate {
                user_id: "x".into(),
                position: json!({"line": 2}),
            }]
        );

        x.send(json!({"type": "code_execution", "output": "42\n"})).await;
        let expected = ServerMessage::ExecutionResult {
            output: json!("42\n"),
            user_id: "x".into(),
        };
        assert_eq!(x.drain(), vec![expected.clone()]);
        assert_eq!(y.drain(), vec![expected]);
    }

    #[tokio::test]
    async fn test_close_leaves_and_notifies() {
        let b = broadcaster();
        b.registry().create("s").await.unwrap();
        let mut x = Peer::new(&b);
        let mut y = Peer::new(&b);
        x.send(json!({"type": "join_session", "sessionId": "s", "userId": "x"})).await;
        y.send(json!({"type": "join_session", "sessionId": "s", "userId": "y"})).await;
        x.drain();

        y.handler.close().await;
        y.handler.close().await;
        assert_eq!(y.handler.state(), &HandlerState::Closed);

        let msgs = x.drain();
        assert_eq!(msgs[0], ServerMessage::user_left("y"));
        assert!(matches!(
            msgs[1],
            ServerMessage::SessionInfo { connected_users: 1, .. }
        ));
        assert_eq!(msgs.len(), 2);

        x.handler.close().await;
        assert!(!b.registry().contains("s").await);
        b.registry().create("s").await.unwrap();
    }

    fn version(code: &str) -> u64 {
        code.trim_start_matches('v').parse().unwrap_or(0)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_joiner_never_sees_older_code_after_newer_update() {
        let b = broadcaster();
        b.registry().create("live").await.unwrap();
        let mut writer = Peer::new(&b);
        writer
            .send(json!({"type": "join_session", "sessionId": "live", "userId": "writer"}))
            .await;

        let stop = Arc::new(AtomicBool::new(false));
        let writing = {
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut version = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    version += 1;
                    writer
                        .send(json!({"type": "code_change", "code": format!("v{version}")}))
                        .await;
                    while writer.outbox.try_recv().is_some() {}
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut joiners = Vec::new();
        for t in 0..4 {
            let b = b.clone();
            joiners.push(tokio::spawn(async move {
                for i in 0..150 {
                    let mut peer = Peer::new(&b);
                    peer.send(json!({
                        "type": "join_session",
                        "sessionId": "live",
                        "userId": format!("j{t}-{i}"),
                    }))
                    .await;
                    tokio::task::yield_now().await;
                    peer.handler.close().await;

                    let msgs = peer.drain();
                    let ServerMessage::JoinedSession { current_code, .. } = &msgs[0] else {
                        panic!("first frame was {:?}", msgs[0]);
                    };
                    let joined_at = version(current_code);
                    for msg in &msgs[1..] {
                        if let ServerMessage::CodeUpdate { code, .. } = msg {
                            assert!(
                                version(code) > joined_at,
                                "{code} queued after joined_session with {current_code}"
                            );
                        }
                    }
                }
            }));
        }
        for joiner in joiners {
            joiner.await.unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        writing.await.unwrap();
    }
}
