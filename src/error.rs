//! Errors returned by the bridge facade

use thiserror::Error;

use crate::inference::ModelLoadError;
use crate::session::SessionState;
use crate::types::{SessionId, TaskId};

/// Errors surfaced to callers of [`crate::Bridge`]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(#[from] ModelLoadError),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Session {session_id} is busy{}", .active_task.as_ref().map(|t| format!(" with task {t}")).unwrap_or_default())]
    SessionBusy {
        session_id: SessionId,
        active_task: Option<TaskId>,
    },

    #[error("Session {session_id} is {state}")]
    SessionUnavailable {
        session_id: SessionId,
        state: SessionState,
    },

    #[error("Session already exists: {0}")]
    SessionExists(SessionId),

    #[error("Session limit reached ({0} loaded)")]
    TooManySessions(usize),

    #[error("Bridge is shutting down")]
    ShuttingDown,

    #[error("Engine worker error: {0}")]
    Worker(String),
}

impl BridgeError {
    /// Stable error code for host runtimes
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::InvalidArgument(_) => "InvalidArgument",
            BridgeError::ModelLoad(_) => "ModelLoadError",
            BridgeError::SessionNotFound(_) | BridgeError::TaskNotFound(_) => "NotFound",
            BridgeError::SessionBusy { .. } => "SessionBusy",
            BridgeError::SessionUnavailable { .. } => "SessionUnavailable",
            BridgeError::SessionExists(_) => "SessionExists",
            BridgeError::TooManySessions(_) => "TooManySessions",
            BridgeError::ShuttingDown => "ShuttingDown",
            BridgeError::Worker(_) => "WorkerError",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BridgeError::SessionNotFound(_) | BridgeError::TaskNotFound(_)
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, BridgeError::SessionBusy { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_message_names_task() {
        let err = BridgeError::SessionBusy {
            session_id: SessionId::from("s1"),
            active_task: Some(TaskId::from("t9")),
        };
        assert_eq!(err.to_string(), "Session s1 is busy with task t9");
        assert_eq!(err.code(), "SessionBusy");
        assert!(err.is_busy());
    }

    #[test]
    fn test_not_found_codes() {
        assert!(BridgeError::TaskNotFound(TaskId::from("t")).is_not_found());
        assert_eq!(
            BridgeError::SessionNotFound(SessionId::from("s")).code(),
            "NotFound"
        );
    }

    #[test]
    fn test_load_error_conversion() {
        let err: BridgeError = ModelLoadError::Format("bad magic".to_string()).into();
        assert_eq!(err.code(), "ModelLoadError");
        assert_eq!(
            err.to_string(),
            "Failed to load model: Unsupported model format: bad magic"
        );
    }
}
