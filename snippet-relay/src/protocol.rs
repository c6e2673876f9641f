//! JSON wire protocol for the session relay.
//!
//! One JSON object per WebSocket text frame, discriminated by `type`:
//! ```text
//! { "type": "join_session", "sessionId": "abcd", "userId": "u1" }
//! { "type": "code_update", "code": "print(1)", "userId": "u1" }
//! ```
//!
//! Editor payloads (`cursor`, `position`, `output`) are opaque to the relay
//! and carried as raw JSON values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Inbound `type` values understood by the relay.
const CLIENT_MESSAGE_TYPES: [&str; 5] = [
    "create_session",
    "join_session",
    "code_change",
    "cursor_position",
    "code_execution",
];

/// Client → relay messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateSession {
        session_id: String,
    },
    JoinSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    CodeChange {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<Value>,
    },
    CursorPosition {
        position: Value,
    },
    CodeExecution {
        output: Value,
    },
}

impl ClientMessage {
    /// Parse one inbound text frame.
    ///
    /// Unknown `type` values and structurally invalid frames both map to
    /// [`RelayError::MalformedMessage`], with distinct messages.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(text).map_err(|_| RelayError::invalid_format())?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(RelayError::invalid_format)?;
        if !CLIENT_MESSAGE_TYPES.contains(&kind) {
            return Err(RelayError::unknown_type(kind));
        }
        serde_json::from_value(value).map_err(|_| RelayError::invalid_format())
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateSession { .. } => "create_session",
            Self::JoinSession { .. } => "join_session",
            Self::CodeChange { .. } => "code_change",
            Self::CursorPosition { .. } => "cursor_position",
            Self::CodeExecution { .. } => "code_execution",
        }
    }
}

/// One entry of a `session_info` member listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub joined_at: DateTime<Utc>,
}

/// Relay → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SessionCreated {
        session_id: String,
    },
    JoinedSession {
        session_id: String,
        user_id: String,
        current_code: String,
    },
    Error {
        message: String,
    },
    SessionInfo {
        session_id: String,
        connected_users: usize,
        users: Vec<UserSummary>,
    },
    UserJoined {
        user_id: String,
        message: String,
    },
    UserLeft {
        user_id: String,
        message: String,
    },
    CodeUpdate {
        code: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<Value>,
    },
    CursorUpdate {
        user_id: String,
        position: Value,
    },
    ExecutionResult {
        output: Value,
        user_id: String,
    },
    SessionExpired {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }

    pub fn user_joined(user_id: &str) -> Self {
        Self::UserJoined {
            user_id: user_id.to_string(),
            message: format!("User {user_id} joined the session"),
        }
    }

    pub fn user_left(user_id: &str) -> Self {
        Self::UserLeft {
            user_id: user_id.to_string(),
            message: format!("User {user_id} left the session"),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
