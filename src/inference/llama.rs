//! llama.cpp backend
//!
//! `LlamaModel` and the `LlamaContext` borrowing it stay on the worker's
//! stack for the whole session; only plain token ids and logits cross the
//! [`InferenceModel`] boundary.

use std::num::NonZeroU32;

use chrono::Utc;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;

use crate::config::BridgeConfig;
use crate::inference::engine::{EngineBackend, EngineFault, InferenceModel, TokenId};
use crate::inference::model::{validate_gguf, LoadedModelInfo, ModelDescriptor, ModelLoadError};

/// llama.cpp may only be initialized once per process
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend, ModelLoadError> {
    BACKEND.get_or_try_init(|| {
        tracing::info!("Initializing llama.cpp backend");
        LlamaBackend::init().map_err(|e| ModelLoadError::Backend(e.to_string()))
    })
}

/// Loads GGUF models through llama.cpp
#[derive(Debug, Clone)]
pub struct LlamaCppBackend {
    gpu_layers: u32,
    batch_size: usize,
}

impl LlamaCppBackend {
    pub fn new(gpu_layers: u32, batch_size: usize) -> Self {
        Self {
            gpu_layers,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.gpu_layers, config.batch_size)
    }
}

impl EngineBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn open(
        &self,
        descriptor: &ModelDescriptor,
        serve: &mut dyn FnMut(&mut dyn InferenceModel),
    ) -> Result<(), ModelLoadError> {
        let path = descriptor.path.as_path();
        let header = validate_gguf(path).map_err(|e| e.into_load_error(path))?;
        tracing::debug!(
            "GGUF v{} with {} tensors, {} metadata entries",
            header.version,
            header.tensor_count,
            header.metadata_kv_count
        );

        let backend = backend()?;
        let gpu_layers = descriptor.gpu_layers.unwrap_or(self.gpu_layers);
        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| ModelLoadError::Backend(e.to_string()))?;

        let n_ctx = match model.n_ctx_train() {
            0 => descriptor.context_size,
            trained => descriptor.context_size.min(trained),
        };
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(self.batch_size as u32);
        let ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| ModelLoadError::OutOfMemory(format!("context of {n_ctx} tokens: {e}")))?;

        let info = LoadedModelInfo {
            name: descriptor.display_name(),
            path: path.to_string_lossy().to_string(),
            quantization: descriptor.quantization.clone(),
            vocab_size: usize::try_from(model.n_vocab()).unwrap_or_default(),
            context_length: n_ctx,
            size_bytes: model.size() as u64,
            loaded_at: Utc::now(),
        };

        let mut session = LlamaSession {
            model: &model,
            ctx,
            batch: LlamaBatch::new(self.batch_size, 1),
            batch_size: self.batch_size,
            n_ctx: n_ctx as usize,
            n_past: 0,
            info,
        };
        serve(&mut session);
        Ok(())
    }
}

struct LlamaSession<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    batch: LlamaBatch,
    batch_size: usize,
    n_ctx: usize,
    /// Tokens already evaluated into the KV cache
    n_past: usize,
    info: LoadedModelInfo,
}

impl InferenceModel for LlamaSession<'_> {
    fn info(&self) -> LoadedModelInfo {
        self.info.clone()
    }

    fn context_size(&self) -> usize {
        self.n_ctx
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineFault> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineFault::Tokenization(e.to_string()))?;
        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn decode_step(&mut self, history: &[TokenId]) -> Result<Vec<f32>, EngineFault> {
        if history.len() > self.n_ctx {
            return Err(EngineFault::ContextOverflow {
                used: history.len(),
                limit: self.n_ctx,
            });
        }
        if self.n_past >= history.len() {
            // Nothing new to evaluate; start over to get fresh logits
            self.reset();
        }

        let pending = &history[self.n_past..];
        for chunk in pending.chunks(self.batch_size) {
            self.batch.clear();
            for (offset, &token) in chunk.iter().enumerate() {
                let pos = self.n_past + offset;
                let is_last = pos + 1 == history.len();
                self.batch
                    .add(LlamaToken::new(token), pos as i32, &[0], is_last)
                    .map_err(|e| EngineFault::Decode(format!("Failed to add token to batch: {e}")))?;
            }
            self.ctx
                .decode(&mut self.batch)
                .map_err(|e| EngineFault::Decode(e.to_string()))?;
            self.n_past += chunk.len();
        }

        Ok(self.ctx.get_logits_ith(self.batch.n_tokens() - 1).to_vec())
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineFault> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| EngineFault::Decode(format!("Failed to convert token to bytes: {e}")))
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn reset(&mut self) {
        self.ctx.clear_kv_cache();
        self.n_past = 0;
    }
}
