// ⚠️ Error taxonomy for the import engine
// Precondition and configuration failures are typed; row-level data problems
// never surface here, they live in the validation report and the audit log.

use crate::session::SessionStatus;
use crate::state_machine::Event;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    // ========================================================================
    // PRECONDITION VIOLATIONS (caller must re-fetch the session)
    // ========================================================================
    #[error("cannot {event} while session is {current}; required one of: {}", format_states(.required))]
    InvalidTransition {
        event: Event,
        current: SessionStatus,
        required: Vec<SessionStatus>,
    },

    #[error("session {session_id} changed concurrently (expected status {expected})")]
    ConcurrentModification {
        session_id: String,
        expected: SessionStatus,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    // ========================================================================
    // CONFIGURATION ERRORS
    // ========================================================================
    #[error("no active schema definition for domain '{0}'")]
    SchemaNotFound(String),

    #[error("unsafe SQL identifier '{0}'")]
    UnsafeIdentifier(String),

    #[error("invalid column mapping: {0}")]
    InvalidMapping(String),

    #[error("invalid validation rule: {0}")]
    InvalidRule(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ========================================================================
    // STORAGE
    // ========================================================================
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ImportError {
    /// Whether a caller may reasonably retry the same call unchanged.
    ///
    /// Only raw storage failures qualify (a busy database, for instance).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ImportError::Storage(_))
    }
}

fn format_states(states: &[SessionStatus]) -> String {
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message_names_states() {
        let err = ImportError::InvalidTransition {
            event: Event::Approve,
            current: SessionStatus::Completed,
            required: vec![SessionStatus::AwaitingApproval],
        };

        let message = err.to_string();
        assert!(message.contains("COMPLETED"));
        assert!(message.contains("AWAITING_APPROVAL"));
        assert!(message.contains("approve"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_configuration_errors_not_retryable() {
        assert!(!ImportError::UnsafeIdentifier("a-b".to_string()).is_retryable());
        assert!(!ImportError::SchemaNotFound("products".to_string()).is_retryable());
    }
}
