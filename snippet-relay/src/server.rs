//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── Outbox A ── Client A
//!            ├── ConnectionHandler ── Registry ──┤
//! Client B ──┘          │                        └── Outbox B ── Client B
//!                       ▼
//!                  Broadcaster ◀── ExpirySweeper (hourly)
//! ```
//!
//! One task per connection multiplexes inbound frames and its outbound
//! queue. The sweeper runs as its own task for the server's lifetime.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::Broadcaster;
use crate::connection::{ConnectionHandle, Outbox};
use crate::error::RelayError;
use crate::handler::ConnectionHandler;
use crate::registry::SessionRegistry;
use crate::sweeper::{ExpirySweeper, DEFAULT_SESSION_TTL, DEFAULT_SWEEP_INTERVAL};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// Pause after an `accept` failure that is not tied to a single connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server-level failures. Per-connection errors never surface here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum session age before eviction
    pub session_ttl: Duration,
    /// Time between expiry sweeps
    pub sweep_interval: Duration,
    /// Outbound frames buffered per connection before drops
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            session_ttl: DEFAULT_SESSION_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            outbound_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub active_sessions: usize,
    pub frames_dropped: u64,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            config,
            broadcaster: Arc::new(Broadcaster::new(registry)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Serve until the process exits.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves.
    ///
    /// Stops accepting and stops the sweeper; sessions are process memory
    /// only and vanish with the process.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", listener.local_addr()?);

        let sweeper = ExpirySweeper::new(
            self.broadcaster.clone(),
            self.config.session_ttl,
            self.config.sweep_interval,
        )
        .spawn();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::error!("Failed to accept connection: {e}");
                            tokio::time::sleep(accept_backoff(&e)).await;
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let broadcaster = self.broadcaster.clone();
                    let stats = self.stats.clone();
                    let capacity = self.config.outbound_capacity;
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, addr, broadcaster, stats, capacity).await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutting down relay server");
                    break;
                }
            }
        }

        sweeper.abort();
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        broadcaster: Arc<Broadcaster>,
        stats: Arc<RwLock<ServerStats>>,
        capacity: usize,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (conn, outbox) = ConnectionHandle::channel(capacity);
        let mut handler = ConnectionHandler::new(conn, broadcaster);
        let result = Self::pump(ws_stream, addr, &mut handler, outbox, &stats).await;

        // Every exit path, clean or not, releases membership.
        handler.close().await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr}");
        result
    }

    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        handler: &mut ConnectionHandler,
        mut outbox: Outbox,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let close_signal = outbox.close_signal();

        loop {
            tokio::select! {
                biased;

                // Outgoing frames first so queued replies keep their order.
                frame = outbox.recv() => {
                    match frame {
                        Some(text) => ws_sender.send(Message::Text(text.to_string().into())).await?,
                        None => break,
                    }
                }

                _ = close_signal.notified() => {
                    while let Some(text) = outbox.try_recv() {
                        ws_sender.send(Message::Text(text.to_string().into())).await?;
                    }
                    if let Some(text) = outbox.parting_frame() {
                        ws_sender.send(Message::Text(text.to_string().into())).await?;
                    }
                    ws_sender.send(Message::Close(None)).await?;
                    break;
                }

                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.write().await.total_frames += 1;
                            handler.handle_frame(text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            stats.write().await.total_frames += 1;
                            match std::str::from_utf8(&data) {
                                Ok(text) => handler.handle_frame(text).await,
                                Err(_) => handler.reject(&RelayError::invalid_format()),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.broadcaster.registry().session_count().await;
        stats.frames_dropped = self.broadcaster.stats().frames_dropped;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Connection-level failures (aborted handshakes, resets) retry at once;
/// anything else, such as running out of file descriptors, waits briefly.
fn accept_backoff(err: &std::io::Error) -> Duration {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted => {
            Duration::ZERO
        }
        _ => ACCEPT_BACKOFF,
    }
}
