//! llamabridge
//!
//! Async bridge between a host runtime and local llama.cpp models. Each
//! loaded model lives in a session served by its own worker thread; prompts
//! become generation tasks whose tokens stream back as events.

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod generation;
pub mod inference;
pub mod session;
pub mod types;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use bridge::Bridge;
pub use config::{BridgeConfig, ConfigError};
pub use error::BridgeError;
pub use events::{Event, EventSink, EventStream, WireEvent};
pub use generation::{CompletionReason, FailureKind, GenerationParams, GenerationStats, TaskState};
pub use inference::{EngineBackend, LoadedModelInfo, ModelDescriptor, ModelLoadError};
pub use session::{SessionInfo, SessionState};
pub use types::{ChatMessage, Role, SessionId, TaskId};

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
///
/// Engine panics are caught on the worker, so shared state must stay usable
/// afterwards.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
