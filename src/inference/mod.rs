//! LLM inference engine
//!
//! Backends load models onto a session's worker thread; the engine handle
//! feeds that worker generation tasks.

pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod sampling;
pub mod scripted;
pub mod streaming;

pub use engine::{EngineBackend, EngineFault, EngineHandle, InferenceModel, LoadReceiver, TokenId};
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use model::{
    validate_gguf, GgufMetadata, LoadedModelInfo, ModelDescriptor, ModelError, ModelLoadError,
    GGUF_MAGIC,
};
pub use sampling::{Sampler, SamplingError};
pub use scripted::{ScriptedBackend, ScriptedStats};
pub use streaming::TokenDecoder;
