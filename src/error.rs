//! Error types for the realtime session engine.

use thiserror::Error;

/// Errors that can occur while operating a realtime session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A protocol event arrived that no processor handles
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A referenced item, response or speech segment does not exist
    #[error("{kind} \"{id}\" not found")]
    NotFound {
        /// What was looked up (item, response, speech segment, tool)
        kind: &'static str,
        /// The missing id
        id: String,
    },

    /// An operation conflicts with current state (double connect, send
    /// while disconnected, duplicate tool name, invalid cancel target)
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// A tool handler failed
    #[error("Tool failure: {0}")]
    ToolFailure(String),

    /// Connection to the backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl SessionError {
    /// Shorthand for a missing-entity error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SessionError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::SerializationError(err.to_string())
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = SessionError::not_found("item", "item_abc");
        assert_eq!(err.to_string(), "item \"item_abc\" not found");
    }

    #[test]
    fn test_serde_error_conversion() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json");
        let err: SessionError = bad.unwrap_err().into();
        assert!(matches!(err, SessionError::SerializationError(_)));
    }
}
