//! Error types for the role hub.

use uuid::Uuid;

/// Errors produced by routing, handlers and sessions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("role {role} is not active")]
    RoleInactive { role: String },

    #[error("handler for {role} failed: {reason}")]
    Handler { role: String, reason: String },

    /// Timeouts, rate limits and other failures worth retrying.
    #[error("transient failure in {role}: {reason}")]
    Transient { role: String, reason: String },

    #[error("request to {role} timed out after {timeout_ms}ms")]
    Timeout { role: String, timeout_ms: u64 },

    #[error("{role} dropped the reply channel")]
    ReplyDropped { role: String },

    #[error("circular call chain: {chain}")]
    CircularCall { chain: String },

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("session {0} is already finalized")]
    SessionClosed(Uuid),

    #[error("{role} is not a participant of session {session}")]
    NotParticipant { role: String, session: Uuid },

    #[error("{role} already responded in session {session}")]
    DuplicateResponse { role: String, session: Uuid },

    #[error("option {option:?} is not on the ballot")]
    InvalidOption { option: String },

    #[error("session needs at least one participant besides the initiator")]
    NoParticipants,
}

impl HubError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, HubError::Transient { .. } | HubError::Timeout { .. })
    }
}

/// Result type for hub operations.
pub type HubResult<T> = std::result::Result<T, HubError>;
