//! # snippet-relay — real-time session relay
//!
//! Participants attach to short-lived, named sessions and see each other's
//! code edits, cursor moves and execution results over WebSocket.
//! All state lives in process memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON frames    ┌───────────────────┐
//! │ RelayClient  │ ◄──────────────► │ ConnectionHandler │ (one per socket)
//! └──────────────┘                  └─────────┬─────────┘
//!                                             │
//!                                             ▼
//!                   ┌──────────────┐   ┌─────────────────┐
//!                   │ Broadcaster  │◄──│ SessionRegistry │
//!                   │ (fan-out)    │   │ (per-session    │
//!                   └──────▲───────┘   │  locking)       │
//!                          │           └────────▲────────┘
//!               PresenceNotifier    ExpirySweeper (TTL)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages
//! - [`error`] — recoverable, connection-local errors
//! - [`registry`] — session membership and code buffer
//! - [`connection`] — per-connection outbound queue
//! - [`broadcast`] — non-blocking fan-out
//! - [`presence`] — membership snapshots
//! - [`sweeper`] — session expiry
//! - [`handler`] — per-connection state machine
//! - [`server`] — WebSocket accept loop
//! - [`client`] — WebSocket client

pub mod protocol;
pub mod error;
pub mod registry;
pub mod connection;
pub mod broadcast;
pub mod presence;
pub mod sweeper;
pub mod handler;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ClientMessage, ServerMessage, UserSummary};
pub use error::RelayError;
pub use registry::{ExpiredSession, JoinOutcome, LeaveOutcome, SessionRegistry, SessionView};
pub use connection::{ConnectionHandle, Delivery, Outbox};
pub use broadcast::{Broadcaster, FanoutStats};
pub use presence::PresenceNotifier;
pub use sweeper::ExpirySweeper;
pub use handler::{ConnectionHandler, HandlerState};
pub use server::{RelayServer, ServerConfig, ServerError, ServerStats};
pub use client::{ClientError, ConnectionState, Identity, RelayClient, RelayEvent};
