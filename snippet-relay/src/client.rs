//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, close, reconnect)
//! - Typed senders for every inbound message type
//! - Decoded relay messages as [`RelayEvent`]s on an mpsc channel
//! - Identity memory: `reconnect()` re-joins with the last user id

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed by the relay
    Disconnected,
    /// A relay message
    Message(ServerMessage),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("No session joined yet")]
    NoIdentity,

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Session membership remembered from the last `joined_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub session_id: String,
    pub user_id: String,
}

pub struct RelayClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    identity: Arc<RwLock<Option<Identity>>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<RelayEvent>>,
    event_tx: mpsc::Sender<RelayEvent>,
}

impl RelayClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            identity: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(RelayEvent::Connected).await;

        // Reader task: decode relay frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let identity = self.identity.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            if let ServerMessage::JoinedSession {
                                session_id,
                                user_id,
                                ..
                            } = &server_msg
                            {
                                *identity.write().await = Some(Identity {
                                    session_id: session_id.clone(),
                                    user_id: user_id.clone(),
                                });
                            }
                            let _ = event_tx.send(RelayEvent::Message(server_msg)).await;
                        }
                        Err(e) => log::warn!("Undecodable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Reconnect and resume presence under the remembered identity.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        let identity = self
            .identity
            .read()
            .await
            .clone()
            .ok_or(ClientError::NoIdentity)?;
        self.close().await;
        self.connect().await?;
        self.join_session(&identity.session_id, Some(&identity.user_id))
            .await
    }

    /// Send a close frame and drop the writer.
    pub async fn close(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
    }

    pub async fn create_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::CreateSession {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn join_session(
        &self,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::JoinSession {
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
        })
        .await
    }

    pub async fn send_code(&self, code: &str, cursor: Option<Value>) -> Result<(), ClientError> {
        self.send(&ClientMessage::CodeChange {
            code: code.to_string(),
            cursor,
        })
        .await
    }

    pub async fn send_cursor(&self, position: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::CursorPosition { position }).await
    }

    pub async fn send_execution(&self, output: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::CodeExecution { output }).await
    }

    /// Send a typed message.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        self.send_raw(msg.encode()?).await
    }

    /// Send an arbitrary text frame, valid or not.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Text(text.into().into()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Identity from the last successful join, if any.
    pub async fn identity(&self) -> Option<Identity> {
        self.identity.read().await.clone()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
