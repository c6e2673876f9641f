//! Periodic eviction of sessions older than the TTL.
//!
//! A coarse sweep, not a per-session timer: a session may outlive its TTL
//! by up to one sweep interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::broadcast::Broadcaster;
use crate::protocol::ServerMessage;

/// Default maximum session age.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct ExpirySweeper {
    broadcaster: Arc<Broadcaster>,
    ttl: Duration,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(broadcaster: Arc<Broadcaster>, ttl: Duration, interval: Duration) -> Self {
        Self {
            broadcaster,
            ttl,
            interval,
        }
    }

    /// Run [`sweep_at`](Self::sweep_at) every interval until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick completes immediately; nothing can be expired yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_at(Utc::now()).await;
            }
        })
    }

    /// One pass against an explicit clock. Returns the evicted session ids.
    ///
    /// Each evicted session is removed from the registry first, so joins
    /// racing the sweep see `NoSuchSession`. Every member then gets
    /// `session_expired` as its parting frame and is closed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired = self.broadcaster.registry().expire(now, self.ttl).await;
        if expired.is_empty() {
            return Vec::new();
        }
        let notice = ServerMessage::SessionExpired {
            message: self.expiry_message(),
        };
        let frame: Option<Arc<str>> = match notice.encode() {
            Ok(text) => Some(Arc::from(text)),
            Err(e) => {
                log::error!("Failed to encode expiry notice: {e}");
                None
            }
        };

        let mut evicted = Vec::with_capacity(expired.len());
        for session in expired {
            for member in &session.members {
                match &frame {
                    Some(frame) => member.close_with(frame.clone()),
                    None => member.request_close(),
                }
            }
            log::info!(
                "Expired session {} cleaned up ({} members disconnected)",
                session.session_id,
                session.members.len()
            );
            evicted.push(session.session_id);
        }
        evicted
    }

    fn expiry_message(&self) -> String {
        let secs = self.ttl.as_secs();
        let (count, unit) = if secs >= 3600 {
            (secs / 3600, "hour")
        } else {
            (secs, "second")
        };
        let plural = if count == 1 { "" } else { "s" };
        format!("Session has expired after {count} {unit}{plural}")
    }
}
