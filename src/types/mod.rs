//! Shared types
//!
//! Identifiers and chat message structures used across the bridge.

pub mod ids;
pub mod message;

pub use ids::{SessionId, TaskId};
pub use message::{format_prompt, ChatMessage, Role};
