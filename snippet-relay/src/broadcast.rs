//! Fan-out of one message to a session's member connections.
//!
//! The message is encoded once and the same `Arc<str>` is enqueued on each
//! recipient's bounded outbound queue with `try_send`. A full or closed
//! queue is skipped, never awaited, so one slow peer cannot stall the rest.
//! Delivery is at-most-once; per-connection FIFO comes from the queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::connection::{ConnectionHandle, Delivery};
use crate::protocol::ServerMessage;
use crate::registry::SessionRegistry;

/// Snapshot of fanout counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

/// Lock-free counters, updated on the hot path.
#[derive(Debug, Default)]
struct AtomicFanoutStats {
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Session-scoped broadcaster over the shared registry.
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    stats: AtomicFanoutStats,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicFanoutStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Send `msg` to every open member of `session_id` except `exclude`.
    ///
    /// Frames are enqueued under the session mutex, so a broadcast is
    /// ordered against joins, leaves and other broadcasts to the session.
    /// Returns the number of connections the frame was queued on.
    pub async fn broadcast(
        &self,
        session_id: &str,
        msg: &ServerMessage,
        exclude: Option<Uuid>,
    ) -> usize {
        let Some(frame) = encode(msg) else {
            return 0;
        };
        self.registry
            .with_session(session_id, |view| {
                self.deliver_frame(view.connections(), &frame, exclude)
            })
            .await
            .unwrap_or(0)
    }

    /// Send `msg` to an explicit set of recipients.
    pub fn deliver<'a>(
        &self,
        recipients: impl IntoIterator<Item = &'a ConnectionHandle>,
        msg: &ServerMessage,
        exclude: Option<Uuid>,
    ) -> usize {
        match encode(msg) {
            Some(frame) => self.deliver_frame(recipients, &frame, exclude),
            None => 0,
        }
    }

    /// Pre-encoded fast path.
    pub fn deliver_frame<'a>(
        &self,
        recipients: impl IntoIterator<Item = &'a ConnectionHandle>,
        frame: &Arc<str>,
        exclude: Option<Uuid>,
    ) -> usize {
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for conn in recipients {
            if Some(conn.id()) == exclude || !conn.is_open() {
                continue;
            }
            match conn.try_send(frame.clone()) {
                Delivery::Queued => delivered += 1,
                Delivery::Full => {
                    log::warn!("Connection {} lagging, dropped frame", conn.id());
                    dropped += 1;
                }
                Delivery::Closed => {}
            }
        }

        self.stats
            .frames_delivered
            .fetch_add(delivered, Ordering::Relaxed);
        self.stats.frames_dropped.fetch_add(dropped, Ordering::Relaxed);
        delivered as usize
    }

    /// Queue `msg` on a single connection (replies to the sender).
    pub fn send_to(&self, conn: &ConnectionHandle, msg: &ServerMessage) -> bool {
        self.deliver(std::slice::from_ref(conn), msg, None) == 1
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

fn encode(msg: &ServerMessage) -> Option<Arc<str>> {
    match msg.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("Failed to encode outbound message: {e}");
            None
        }
    }
}
