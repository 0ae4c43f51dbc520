//! Deterministic in-process backend
//!
//! Produces a fixed cycle of words without touching native code. Used by the
//! test suites and for exercising the bridge on machines without a model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::inference::engine::{EngineBackend, EngineFault, InferenceModel, TokenId};
use crate::inference::model::{LoadedModelInfo, ModelDescriptor, ModelLoadError};

const VOCAB: [&str; 10] = [
    "<eos>", "<unk>", " the", " quick", " brown", " fox", " jumps", " over", " lazy", " dog",
];
const EOS: TokenId = 0;
const UNK: TokenId = 1;
/// Ids below this are never chosen as regular output
const FIRST_WORD: usize = 2;

/// Counters shared between a backend and every model it opened
#[derive(Debug, Default)]
pub struct ScriptedStats {
    loads: AtomicUsize,
    unloads: AtomicUsize,
    decode_steps: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedStats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn decode_steps(&self) -> usize {
        self.decode_steps.load(Ordering::SeqCst)
    }

    /// Highest number of decode steps that ever overlapped
    pub fn peak_concurrent_steps(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
struct Script {
    step_delay: Duration,
    load_delay: Duration,
    eos_after: Option<usize>,
    fault_at_step: Option<usize>,
    panic_at_step: Option<usize>,
    load_error: Option<ModelLoadError>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    script: Script,
    stats: Arc<ScriptedStats>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every decode step
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.script.step_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.script.load_delay = delay;
        self
    }

    /// Emit end-of-sequence once `n` tokens were generated
    pub fn with_eos_after(mut self, n: usize) -> Self {
        self.script.eos_after = Some(n);
        self
    }

    /// Fail the `n`th decode step (0-based, counted across all models)
    pub fn with_fault_at_step(mut self, n: usize) -> Self {
        self.script.fault_at_step = Some(n);
        self
    }

    /// Panic in the `n`th decode step (0-based, counted across all models)
    pub fn with_panic_at_step(mut self, n: usize) -> Self {
        self.script.panic_at_step = Some(n);
        self
    }

    pub fn with_load_error(mut self, error: ModelLoadError) -> Self {
        self.script.load_error = Some(error);
        self
    }

    pub fn stats(&self) -> Arc<ScriptedStats> {
        Arc::clone(&self.stats)
    }
}

impl EngineBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(
        &self,
        descriptor: &ModelDescriptor,
        serve: &mut dyn FnMut(&mut dyn InferenceModel),
    ) -> Result<(), ModelLoadError> {
        if !self.script.load_delay.is_zero() {
            thread::sleep(self.script.load_delay);
        }
        if let Some(error) = &self.script.load_error {
            return Err(error.clone());
        }

        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        let mut model = ScriptedModel {
            script: self.script.clone(),
            stats: Arc::clone(&self.stats),
            info: LoadedModelInfo {
                name: descriptor.display_name(),
                path: descriptor.path.to_string_lossy().to_string(),
                quantization: descriptor.quantization.clone(),
                vocab_size: VOCAB.len(),
                context_length: descriptor.context_size,
                size_bytes: 0,
                loaded_at: Utc::now(),
            },
            context_size: descriptor.context_size as usize,
            base: None,
        };
        serve(&mut model);
        Ok(())
    }
}

struct ScriptedModel {
    script: Script,
    stats: Arc<ScriptedStats>,
    info: LoadedModelInfo,
    context_size: usize,
    /// History length at the first step after a reset
    base: Option<usize>,
}

/// Keeps the in-flight counter right even when a step panics
struct InFlight<'a>(&'a ScriptedStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a ScriptedStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InferenceModel for ScriptedModel {
    fn info(&self) -> LoadedModelInfo {
        self.info.clone()
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineFault> {
        Ok(text
            .split_whitespace()
            .map(|word| {
                VOCAB
                    .iter()
                    .position(|entry| entry.trim_start() == word)
                    .filter(|&id| id >= FIRST_WORD)
                    .map_or(UNK, |id| id as TokenId)
            })
            .collect())
    }

    fn decode_step(&mut self, history: &[TokenId]) -> Result<Vec<f32>, EngineFault> {
        let _guard = InFlight::enter(&self.stats);
        let step = self.stats.decode_steps.fetch_add(1, Ordering::SeqCst);

        if !self.script.step_delay.is_zero() {
            thread::sleep(self.script.step_delay);
        }
        if self.script.panic_at_step == Some(step) {
            panic!("scripted panic at decode step {step}");
        }
        if self.script.fault_at_step == Some(step) {
            return Err(EngineFault::Decode(format!("scripted fault at step {step}")));
        }
        if history.len() > self.context_size {
            return Err(EngineFault::ContextOverflow {
                used: history.len(),
                limit: self.context_size,
            });
        }

        let base = *self.base.get_or_insert(history.len());
        let generated = history.len().saturating_sub(base);

        let next = match self.script.eos_after {
            Some(n) if generated >= n => EOS as usize,
            _ => FIRST_WORD + history.len() % (VOCAB.len() - FIRST_WORD),
        };
        let mut logits = vec![-8.0; VOCAB.len()];
        logits[next] = 8.0;
        Ok(logits)
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineFault> {
        usize::try_from(token)
            .ok()
            .and_then(|id| VOCAB.get(id))
            .map(|piece| piece.as_bytes().to_vec())
            .ok_or_else(|| EngineFault::Decode(format!("unknown token id {token}")))
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn reset(&mut self) {
        self.base = None;
    }
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.stats.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_model<R>(backend: &ScriptedBackend, f: impl FnOnce(&mut dyn InferenceModel) -> R) -> R {
        let mut f = Some(f);
        let mut out = None;
        backend
            .open(&ModelDescriptor::new("m.bin"), &mut |model| {
                if let Some(f) = f.take() {
                    out = Some(f(model));
                }
            })
            .unwrap();
        out.unwrap()
    }

    #[test]
    fn test_tokenize_maps_unknown_words() {
        let backend = ScriptedBackend::new();
        let tokens = with_model(&backend, |model| model.tokenize("the cat fox").unwrap());
        assert_eq!(tokens, vec![2, UNK, 5]);
    }

    #[test]
    fn test_cycle_and_eos() {
        let backend = ScriptedBackend::new().with_eos_after(2);
        let picks = with_model(&backend, |model| {
            let mut history = vec![UNK];
            let mut picks = Vec::new();
            for _ in 0..3 {
                let logits = model.decode_step(&history).unwrap();
                let best = logits
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i as TokenId)
                    .unwrap();
                picks.push(best);
                history.push(best);
            }
            picks
        });
        assert_eq!(picks, vec![3, 4, EOS]);
    }

    #[test]
    fn test_fault_fires_once() {
        let backend = ScriptedBackend::new().with_fault_at_step(1);
        with_model(&backend, |model| {
            assert!(model.decode_step(&[UNK]).is_ok());
            assert!(matches!(
                model.decode_step(&[UNK, 3]),
                Err(EngineFault::Decode(_))
            ));
            assert!(model.decode_step(&[UNK, 3]).is_ok());
        });
    }

    #[test]
    fn test_stats_track_lifecycle() {
        let backend = ScriptedBackend::new();
        let stats = backend.stats();
        with_model(&backend, |model| {
            model.decode_step(&[UNK]).unwrap();
        });
        assert_eq!(stats.loads(), 1);
        assert_eq!(stats.unloads(), 1);
        assert_eq!(stats.decode_steps(), 1);
        assert_eq!(stats.peak_concurrent_steps(), 1);
    }

    #[test]
    fn test_load_error() {
        let backend = ScriptedBackend::new().with_load_error(ModelLoadError::OutOfMemory(
            "no room".to_string(),
        ));
        let result = backend.open(&ModelDescriptor::new("m.bin"), &mut |_| {});
        assert!(matches!(result, Err(ModelLoadError::OutOfMemory(_))));
        assert_eq!(backend.stats().loads(), 0);
    }
}
