//! Outbound side of one relay connection.
//!
//! The socket task owns the receiving half ([`Outbox`]); sessions and
//! fanout only ever hold cheap [`ConnectionHandle`] clones. Frames are
//! pre-encoded `Arc<str>` so a broadcast serializes once.

use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full: the peer is not draining fast enough.
    Full,
    /// The socket task has gone away.
    Closed,
}

/// Non-owning, cloneable handle to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<Arc<str>>,
    close: Arc<Notify>,
    parting: Arc<OnceLock<Arc<str>>>,
}

/// Receiving half, owned by the connection's socket task.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<Arc<str>>,
    close: Arc<Notify>,
    parting: Arc<OnceLock<Arc<str>>>,
}

impl ConnectionHandle {
    /// Create a connection with a bounded outbound queue.
    pub fn channel(capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let close = Arc::new(Notify::new());
        let parting = Arc::new(OnceLock::new());
        let handle = Self {
            id: Uuid::new_v4(),
            tx,
            close: close.clone(),
            parting: parting.clone(),
        };
        (
            handle,
            Outbox {
                rx,
                close,
                parting,
            },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the socket task is still draining this connection.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Enqueue a frame without waiting.
    pub fn try_send(&self, frame: Arc<str>) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Ask the socket task to flush queued frames and close.
    ///
    /// The request is remembered if the task is not currently waiting.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    /// Close after sending `frame` as the last data frame.
    ///
    /// The frame bypasses the bounded queue, so it is delivered even when
    /// the queue is full. Only the first parting frame is kept.
    pub fn close_with(&self, frame: Arc<str>) {
        let _ = self.parting.set(frame);
        self.close.notify_one();
    }
}

impl Outbox {
    /// Next queued frame, or `None` once every handle is dropped.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    /// Queued frame if one is immediately available.
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }

    /// Signal fired by [`ConnectionHandle::request_close`].
    ///
    /// Returned owned so it can be awaited alongside [`Outbox::recv`].
    pub fn close_signal(&self) -> Arc<Notify> {
        self.close.clone()
    }

    /// Frame set by [`ConnectionHandle::close_with`], sent after the queue drains.
    pub fn parting_frame(&self) -> Option<Arc<str>> {
        self.parting.get().cloned()
    }
}
