//! Recoverable, connection-local relay errors.
//!
//! Every variant is reported back to the offending connection as an
//! `error` frame. None of them closes the connection or touches any other
//! session.

use thiserror::Error;

/// Errors produced by registry operations and frame parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// `create_session` for an id that is already live.
    #[error("Session already exists.")]
    AlreadyExists(String),

    /// Join or operation against a session that does not exist.
    #[error("Session does not exist.")]
    NoSuchSession(String),

    /// The effective user id is already a live member of the session.
    #[error("User already connected in this session.")]
    DuplicateUser(String),

    /// Frame is not valid JSON, lacks required fields, or has an unknown type.
    #[error("{0}")]
    MalformedMessage(String),
}

impl RelayError {
    pub(crate) fn invalid_format() -> Self {
        Self::MalformedMessage("Invalid message format".to_string())
    }

    pub(crate) fn unknown_type(kind: &str) -> Self {
        Self::MalformedMessage(format!("Unknown message type: {kind}"))
    }
}
