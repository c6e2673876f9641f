//! Membership snapshots broadcast on every join and leave.
//!
//! `session_info` always carries the full member list, never a delta, so a
//! client that misses one update self-heals on the next.
//!
//! ```text
//! join  ──▶ user_joined (others) ──▶ session_info (all)
//! leave ──▶ user_left (remaining) ──▶ session_info (remaining)
//! ```

use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::protocol::ServerMessage;
use crate::registry::{LeaveOutcome, SessionView};

/// Build the current `session_info` snapshot, or `None` if the session is
/// empty.
pub fn session_info(view: &SessionView<'_>) -> Option<ServerMessage> {
    if view.is_empty() {
        return None;
    }
    let users = view.members();
    Some(ServerMessage::SessionInfo {
        session_id: view.session_id().to_string(),
        connected_users: users.len(),
        users,
    })
}

/// Pushes presence changes to session members.
///
/// Every method takes a [`SessionView`] and so runs inside the registry
/// hook of the change it reports.
#[derive(Debug, Clone, Copy)]
pub struct PresenceNotifier<'a> {
    broadcaster: &'a Broadcaster,
}

impl<'a> PresenceNotifier<'a> {
    pub fn new(broadcaster: &'a Broadcaster) -> Self {
        Self { broadcaster }
    }

    /// Announce a new member to its peers, then refresh everyone's snapshot.
    pub fn member_joined(&self, view: &SessionView<'_>, user_id: &str, connection_id: Uuid) {
        self.broadcaster.deliver(
            view.connections(),
            &ServerMessage::user_joined(user_id),
            Some(connection_id),
        );
        self.refresh(view);
        log::info!("User {user_id} joined session {}", view.session_id());
    }

    /// Announce a departure to the remaining members.
    ///
    /// Nothing is sent when the departure deleted the session.
    pub fn member_left(&self, view: &SessionView<'_>, outcome: &LeaveOutcome) {
        log::info!(
            "User {} disconnected from session {}",
            outcome.user_id,
            view.session_id()
        );
        if outcome.session_deleted {
            return;
        }
        self.broadcaster.deliver(
            view.connections(),
            &ServerMessage::user_left(&outcome.user_id),
            None,
        );
        self.refresh(view);
    }

    /// Send the current membership snapshot to all members.
    pub fn refresh(&self, view: &SessionView<'_>) -> usize {
        match session_info(view) {
            Some(info) => self.broadcaster.deliver(view.connections(), &info, None),
            None => 0,
        }
    }
}
