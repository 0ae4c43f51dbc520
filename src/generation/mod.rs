//! Generation tasks
//!
//! One task is one prompt-to-token-stream request against a session. Tasks
//! move `Pending -> Running -> {Completed, Cancelled, Failed}` and report
//! every step through the event emitter.

pub mod params;
pub mod table;
pub mod task;

use serde::{Deserialize, Serialize};

use crate::inference::EngineFault;

pub use params::GenerationParams;
pub use table::TaskTable;
pub use task::{TaskControl, TaskState};

/// Why a task completed normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionReason {
    /// Produced `max_tokens` tokens
    MaxTokens,
    /// Output ended with a configured stop sequence
    StopSequence,
    /// The engine sampled its end-of-sequence token
    EndOfSequence,
}

/// Why a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Engine decode or sampling error, or an engine panic
    Engine,
    /// Prompt plus output no longer fits the context window
    ContextOverflow,
    /// The prompt could not be tokenized
    Tokenization,
    /// The event queue was full when a token had to be emitted
    BackpressureExceeded,
}

impl From<&EngineFault> for FailureKind {
    fn from(fault: &EngineFault) -> Self {
        match fault {
            EngineFault::ContextOverflow { .. } => FailureKind::ContextOverflow,
            EngineFault::Tokenization(_) => FailureKind::Tokenization,
            EngineFault::Decode(_) => FailureKind::Engine,
        }
    }
}

/// Usage and timing reported with a completed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub elapsed_ms: u64,
    pub tokens_per_second: f64,
}

impl GenerationStats {
    pub fn new(prompt_tokens: usize, completion_tokens: usize, elapsed_ms: u64) -> Self {
        let tokens_per_second = if elapsed_ms > 0 {
            completion_tokens as f64 / (elapsed_ms as f64 / 1000.0)
        } else {
            0.0
        };
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            elapsed_ms,
            tokens_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_rate() {
        let stats = GenerationStats::new(4, 10, 500);
        assert_eq!(stats.total_tokens, 14);
        assert!((stats.tokens_per_second - 20.0).abs() < 1e-9);
        assert_eq!(GenerationStats::new(1, 1, 0).tokens_per_second, 0.0);
    }

    #[test]
    fn test_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&CompletionReason::MaxTokens).unwrap(),
            "\"maxTokens\""
        );
        assert_eq!(
            serde_json::to_string(&FailureKind::BackpressureExceeded).unwrap(),
            "\"backpressureExceeded\""
        );
    }

    #[test]
    fn test_fault_kinds() {
        let overflow = EngineFault::ContextOverflow { used: 10, limit: 8 };
        assert_eq!(FailureKind::from(&overflow), FailureKind::ContextOverflow);
        let decode = EngineFault::Decode("nan".to_string());
        assert_eq!(FailureKind::from(&decode), FailureKind::Engine);
    }
}
