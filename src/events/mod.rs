//! Event delivery
//!
//! Engine progress reaches the caller as a stream of [`Event`]s. Producers
//! enqueue through an [`EventEmitter`] without waiting; a consumer task
//! hands events to an [`EventSink`].

pub mod emitter;
pub mod sink;

use serde::Serialize;
use serde_json::{json, Value};

use crate::generation::{CompletionReason, FailureKind, GenerationStats};
use crate::inference::{LoadedModelInfo, TokenId};
use crate::types::{SessionId, TaskId};

pub use emitter::{Backlog, EmitError, EventEmitter};
pub use sink::{channel, ChannelSink, EventSink, EventStream, FnSink, SinkClosed};

/// Something the bridge reports to its caller.
///
/// Events of one task arrive in production order; nothing is guaranteed
/// across tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TokenProduced {
        task_id: TaskId,
        /// Decoded text of the token, empty while a character is incomplete
        token: String,
        token_id: TokenId,
        /// Zero-based position in the task's output
        index: usize,
    },
    GenerationCompleted {
        task_id: TaskId,
        reason: CompletionReason,
        /// Full output, cut before the stop sequence if one matched
        text: String,
        stats: GenerationStats,
    },
    GenerationCancelled {
        task_id: TaskId,
        tokens_emitted: usize,
    },
    GenerationFailed {
        task_id: TaskId,
        kind: FailureKind,
        message: String,
    },
    ModelLoaded {
        session_id: SessionId,
        model: LoadedModelInfo,
    },
    ModelUnloaded {
        session_id: SessionId,
    },
}

/// Flat `{type, taskId|sessionId, payload}` shape handed to host runtimes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub payload: Value,
}

impl Event {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TokenProduced { .. } => "tokenProduced",
            Event::GenerationCompleted { .. } => "generationCompleted",
            Event::GenerationCancelled { .. } => "generationCancelled",
            Event::GenerationFailed { .. } => "generationFailed",
            Event::ModelLoaded { .. } => "modelLoaded",
            Event::ModelUnloaded { .. } => "modelUnloaded",
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Event::TokenProduced { task_id, .. }
            | Event::GenerationCompleted { task_id, .. }
            | Event::GenerationCancelled { task_id, .. }
            | Event::GenerationFailed { task_id, .. } => Some(task_id),
            Event::ModelLoaded { .. } | Event::ModelUnloaded { .. } => None,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Event::ModelLoaded { session_id, .. } | Event::ModelUnloaded { session_id } => {
                Some(session_id)
            }
            _ => None,
        }
    }

    /// True for the last event a task ever produces
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::GenerationCompleted { .. }
                | Event::GenerationCancelled { .. }
                | Event::GenerationFailed { .. }
        )
    }

    pub fn to_wire(&self) -> WireEvent {
        let payload = match self {
            Event::TokenProduced {
                token,
                token_id,
                index,
                ..
            } => json!({ "token": token, "tokenId": token_id, "index": index }),
            Event::GenerationCompleted {
                reason,
                text,
                stats,
                ..
            } => json!({ "reason": reason, "text": text, "stats": stats }),
            Event::GenerationCancelled { tokens_emitted, .. } => {
                json!({ "tokensEmitted": tokens_emitted })
            }
            Event::GenerationFailed { kind, message, .. } => {
                json!({ "errorKind": kind, "message": message })
            }
            Event::ModelLoaded { model, .. } => json!({ "model": model }),
            Event::ModelUnloaded { .. } => Value::Null,
        };
        WireEvent {
            kind: self.kind(),
            task_id: self.task_id().cloned(),
            session_id: self.session_id().cloned(),
            payload,
        }
    }
}
