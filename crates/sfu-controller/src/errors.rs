//! SFU controller error types.
//!
//! Error types map to numeric error codes carried in `error` notifications.
//! Internal details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use crate::session::state::{SessionEvent, SessionState};
use thiserror::Error;

/// SFU controller error type.
///
/// Maps to client error codes:
/// - `InvalidInput`: `INVALID_INPUT` (1)
/// - `NotFound`: `NOT_FOUND` (4)
/// - `Conflict`, `IllegalTransition`: `CONFLICT` (5)
/// - `Engine`, `WorkerCrash`, `Store`, `Config`, `Internal`: `INTERNAL_ERROR` (6)
/// - `Capacity`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum SfuError {
    /// Referenced room, participant, router, transport or stream is absent.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Malformed request payload (e.g. capability set without codecs).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No active worker can host another router.
    #[error("No worker capacity available")]
    Capacity,

    /// The media engine rejected the call.
    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    /// The worker hosting the resource died.
    #[error("Worker {0} crashed")]
    WorkerCrash(u32),

    /// The participant state machine does not allow this event.
    #[error("Illegal transition: {event:?} while {from:?}")]
    IllegalTransition {
        from: SessionState,
        event: SessionEvent,
    },

    /// Request conflicts with existing session state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The persistence collaborator failed.
    #[error("Session store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error")]
    Internal,
}

impl SfuError {
    pub(crate) fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        SfuError::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Returns the numeric error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::InvalidInput(_) => 1, // INVALID_INPUT
            SfuError::NotFound { .. } => 4, // NOT_FOUND
            SfuError::Conflict(_) | SfuError::IllegalTransition { .. } => 5, // CONFLICT
            SfuError::Engine(_)
            | SfuError::WorkerCrash(_)
            | SfuError::Store(_)
            | SfuError::Config(_)
            | SfuError::Internal => 6, // INTERNAL_ERROR
            SfuError::Capacity => 7, // CAPACITY_EXCEEDED
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SfuError::NotFound { entity, .. } => format!("{entity} not found"),
            SfuError::InvalidInput(msg) | SfuError::Conflict(msg) => msg.clone(),
            SfuError::Capacity => "Server is at capacity, please try again".to_string(),
            SfuError::Engine(_) => "Media operation failed".to_string(),
            SfuError::WorkerCrash(_) => "Media server restarting, please retry".to_string(),
            SfuError::IllegalTransition { .. } => {
                "Operation not allowed in the current session state".to_string()
            }
            SfuError::Store(_) | SfuError::Config(_) | SfuError::Internal => {
                "An internal error occurred".to_string()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            SfuError::InvalidInput("no codecs".to_string()).error_code(),
            1
        );
        assert_eq!(SfuError::not_found("Room", "room-1").error_code(), 4);
        assert_eq!(
            SfuError::Conflict("already joined".to_string()).error_code(),
            5
        );
        assert_eq!(
            SfuError::IllegalTransition {
                from: SessionState::Removed,
                event: SessionEvent::Heartbeat,
            }
            .error_code(),
            5
        );
        assert_eq!(
            SfuError::Engine(EngineError::Rejected("dtls".to_string())).error_code(),
            6
        );
        assert_eq!(SfuError::WorkerCrash(3).error_code(), 6);
        assert_eq!(SfuError::Store("timeout".to_string()).error_code(), 6);
        assert_eq!(SfuError::Internal.error_code(), 6);
        assert_eq!(SfuError::Capacity.error_code(), 7);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let store_err = SfuError::Store("connection refused at 10.0.0.7:27017".to_string());
        assert!(!store_err.client_message().contains("10.0.0.7"));
        assert_eq!(store_err.client_message(), "An internal error occurred");

        let engine_err = SfuError::Engine(EngineError::Rejected(
            "transport 5f1c already connected".to_string(),
        ));
        assert!(!engine_err.client_message().contains("5f1c"));

        let missing = SfuError::not_found("Participant", "uid-secret-42");
        assert_eq!(missing.client_message(), "Participant not found");
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: SfuError = EngineError::WorkerClosed.into();
        assert!(matches!(err, SfuError::Engine(EngineError::WorkerClosed)));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", SfuError::not_found("Room", "abc")),
            "Room not found: abc"
        );
        assert_eq!(
            format!(
                "{}",
                SfuError::IllegalTransition {
                    from: SessionState::Announced,
                    event: SessionEvent::Disconnect,
                }
            ),
            "Illegal transition: Disconnect while Announced"
        );
    }
}
