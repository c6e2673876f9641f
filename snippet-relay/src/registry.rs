//! Session registry: session id → membership and shared code buffer.
//!
//! ```text
//! RwLock<HashMap<id, Arc<Mutex<Session>>>>
//!         │                   │
//!         │                   └── per-session lock: join / leave / set_code
//!         └── map lock: lookup, insert, remove only
//! ```
//!
//! Every operation on one session runs under that session's mutex, so the
//! duplicate-user check and the "last member leaves → delete" rule cannot
//! interleave. Different sessions proceed in parallel.
//!
//! A session is marked `closed` under its own mutex before it leaves the map.
//! A join that fetched the `Arc` just before removal therefore observes
//! `NoSuchSession` instead of resurrecting a dead session.
//!
//! Lock order is always map → session.
//!
//! Frames that report a change (`joined_session`, presence, `code_update`)
//! are enqueued by a hook that runs while the session mutex is still held,
//! so every member's queue sees changes in the order they were applied.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::error::RelayError;
use crate::protocol::UserSummary;

/// Length of relay-generated user ids.
const GENERATED_USER_ID_LEN: usize = 6;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// One joined connection within a session.
#[derive(Debug, Clone)]
struct Member {
    user_id: String,
    joined_at: DateTime<Utc>,
    connection: ConnectionHandle,
}

#[derive(Debug)]
struct Session {
    /// Join order; used for presence listings only.
    members: Vec<Member>,
    code: String,
    created_at: DateTime<Utc>,
    closed: bool,
}

impl Session {
    fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            members: Vec::new(),
            code: String::new(),
            created_at,
            closed: false,
        }
    }

    fn has_user(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        (now - self.created_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }
}

/// Successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub user_id: String,
    /// Code buffer at join time, so late joiners see current state.
    pub current_code: String,
}

/// Result of removing a connection from its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub user_id: String,
    pub remaining: usize,
    /// The session emptied and was deleted.
    pub session_deleted: bool,
}

/// A session evicted by [`SessionRegistry::expire`].
#[derive(Debug, Clone)]
pub struct ExpiredSession {
    pub session_id: String,
    pub members: Vec<ConnectionHandle>,
}

/// Read-only view of a session whose mutex is currently held.
pub struct SessionView<'a> {
    session_id: &'a str,
    session: &'a Session,
}

impl SessionView<'_> {
    pub fn session_id(&self) -> &str {
        self.session_id
    }

    /// Member connections in join order.
    pub fn connections(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.session.members.iter().map(|m| &m.connection)
    }

    /// Member ids and join times in join order.
    pub fn members(&self) -> Vec<UserSummary> {
        self.session
            .members
            .iter()
            .map(|m| UserSummary {
                id: m.user_id.clone(),
                joined_at: m.joined_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.session.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.session.members.is_empty()
    }
}

/// Shared, per-session serialized session store.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty session.
    ///
    /// Fails with `AlreadyExists` while a live session holds the id.
    pub async fn create(&self, session_id: &str) -> Result<(), RelayError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            if !existing.lock().await.closed {
                return Err(RelayError::AlreadyExists(session_id.to_string()));
            }
        }
        sessions.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(Session::new(Utc::now()))),
        );
        log::info!("Session {session_id} created");
        Ok(())
    }

    /// Add `connection` to a session as `requested_user_id`, or as a
    /// generated id when none (or an empty one) is supplied.
    pub async fn join(
        &self,
        session_id: &str,
        requested_user_id: Option<&str>,
        connection: ConnectionHandle,
    ) -> Result<JoinOutcome, RelayError> {
        self.join_with(session_id, requested_user_id, connection, |_, _| {})
            .await
    }

    /// [`join`](Self::join), running `on_joined` before the session
    /// mutex is released.
    pub async fn join_with<F>(
        &self,
        session_id: &str,
        requested_user_id: Option<&str>,
        connection: ConnectionHandle,
        on_joined: F,
    ) -> Result<JoinOutcome, RelayError>
    where
        F: FnOnce(&JoinOutcome, &SessionView<'_>),
    {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| RelayError::NoSuchSession(session_id.to_string()))?;
        let mut session = session.lock().await;
        if session.closed {
            return Err(RelayError::NoSuchSession(session_id.to_string()));
        }

        let user_id = match requested_user_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generate_user_id(),
        };
        if session.has_user(&user_id) {
            return Err(RelayError::DuplicateUser(user_id));
        }

        session.members.push(Member {
            user_id: user_id.clone(),
            joined_at: Utc::now(),
            connection,
        });
        let outcome = JoinOutcome {
            user_id,
            current_code: session.code.clone(),
        };
        on_joined(
            &outcome,
            &SessionView {
                session_id,
                session: &session,
            },
        );
        Ok(outcome)
    }

    /// Remove the member bound to `connection_id`.
    ///
    /// Returns `None` if the session or member is already gone, so a
    /// duplicate close is harmless. Deletes the session when it empties.
    pub async fn leave(&self, session_id: &str, connection_id: Uuid) -> Option<LeaveOutcome> {
        self.leave_with(session_id, connection_id, |_, _| {}).await
    }

    /// [`leave`](Self::leave), running `on_left` against the remaining
    /// members before the session mutex is released.
    pub async fn leave_with<F>(
        &self,
        session_id: &str,
        connection_id: Uuid,
        on_left: F,
    ) -> Option<LeaveOutcome>
    where
        F: FnOnce(&LeaveOutcome, &SessionView<'_>),
    {
        let handle = self.get(session_id).await?;
        let outcome = {
            let mut session = handle.lock().await;
            if session.closed {
                return None;
            }
            let index = session
                .members
                .iter()
                .position(|m| m.connection.id() == connection_id)?;
            let member = session.members.remove(index);
            let remaining = session.members.len();
            if remaining == 0 {
                session.closed = true;
            }
            let outcome = LeaveOutcome {
                user_id: member.user_id,
                remaining,
                session_deleted: remaining == 0,
            };
            on_left(
                &outcome,
                &SessionView {
                    session_id,
                    session: &session,
                },
            );
            outcome
        };

        if outcome.session_deleted {
            let mut sessions = self.sessions.write().await;
            // The id may already belong to a newer session.
            if sessions
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &handle))
            {
                sessions.remove(session_id);
            }
            log::info!("Session {session_id} deleted (no active clients)");
        }
        Some(outcome)
    }

    /// Replace the shared code buffer. Last writer wins.
    ///
    /// Returns `false` when the session no longer exists.
    pub async fn set_code(&self, session_id: &str, code: &str) -> bool {
        self.set_code_with(session_id, code, |_| {}).await
    }

    /// [`set_code`](Self::set_code), running `on_set` before the session
    /// mutex is released.
    pub async fn set_code_with<F>(&self, session_id: &str, code: &str, on_set: F) -> bool
    where
        F: FnOnce(&SessionView<'_>),
    {
        let Some(session) = self.get(session_id).await else {
            return false;
        };
        let mut session = session.lock().await;
        if session.closed {
            return false;
        }
        session.code = code.to_string();
        on_set(&SessionView {
            session_id,
            session: &session,
        });
        true
    }

    /// Run `f` against a live session under its mutex.
    pub async fn with_session<F, R>(&self, session_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&SessionView<'_>) -> R,
    {
        let session = self.get(session_id).await?;
        let session = session.lock().await;
        if session.closed {
            return None;
        }
        Some(f(&SessionView {
            session_id,
            session: &session,
        }))
    }

    /// Current code buffer, if the session exists.
    pub async fn code(&self, session_id: &str) -> Option<String> {
        let session = self.get(session_id).await?;
        let session = session.lock().await;
        (!session.closed).then(|| session.code.clone())
    }

    /// Member ids and join times in join order; empty if the session is gone.
    pub async fn list_members(&self, session_id: &str) -> Vec<UserSummary> {
        self.with_session(session_id, |view| view.members())
            .await
            .unwrap_or_default()
    }

    /// Remove every session older than `ttl` as of `now`.
    pub async fn expire(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<ExpiredSession> {
        let mut sessions = self.sessions.write().await;
        let mut expired = Vec::new();
        let mut expired_ids = Vec::new();

        for (session_id, handle) in sessions.iter() {
            let mut session = handle.lock().await;
            if session.closed || !session.is_expired(now, ttl) {
                continue;
            }
            session.closed = true;
            let members = std::mem::take(&mut session.members)
                .into_iter()
                .map(|m| m.connection)
                .collect();
            expired_ids.push(session_id.clone());
            expired.push(ExpiredSession {
                session_id: session_id.clone(),
                members,
            });
        }

        for session_id in &expired_ids {
            sessions.remove(session_id);
        }
        expired
    }

    /// Whether a live session holds `session_id`.
    pub async fn contains(&self, session_id: &str) -> bool {
        match self.get(session_id).await {
            Some(session) => !session.lock().await.closed,
            None => false,
        }
    }

    /// Number of sessions in the map.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(session_id).cloned()
    }
}

/// Short random lowercase alphanumeric token.
///
/// Not collision-free; `DuplicateUser` is the backstop.
pub fn generate_user_id() -> String {
    let mut bits = Uuid::new_v4().as_u128();
    let mut id = String::with_capacity(GENERATED_USER_ID_LEN);
    for _ in 0..GENERATED_USER_ID_LEN {
        id.push(BASE36[(bits % 36) as usize] as char);
        bits /= 36;
    }
    id
}
