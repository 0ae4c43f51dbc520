//! Token sampling
//!
//! Turns the next-token distribution returned by a decode step into a token
//! id. Temperature below 0.01 samples greedily.

use std::cmp::Ordering;

use thiserror::Error;

use crate::inference::engine::TokenId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SamplingError {
    #[error("Engine returned an empty distribution")]
    EmptyDistribution,

    #[error("Distribution contains no finite logits")]
    NoFiniteLogits,
}

/// xorshift64 generator so a fixed seed reproduces a generation
#[derive(Debug, Clone)]
struct XorShift {
    state: u64,
}

impl XorShift {
    fn new(seed: u64) -> Self {
        // zero state would stay zero forever
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    /// Uniform float in [0, 1)
    fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Sampler chain: repeat penalty, temperature, top-k, top-p, draw.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repeat_penalty: f32,
    rng: XorShift,
}

impl Sampler {
    /// Create a sampler. `seed == 0` picks a random seed.
    pub fn new(temperature: f32, top_k: u32, top_p: f32, repeat_penalty: f32, seed: u64) -> Self {
        let seed = if seed == 0 { rand_seed() } else { seed };
        Self {
            temperature,
            top_k: top_k as usize,
            top_p,
            repeat_penalty,
            rng: XorShift::new(seed),
        }
    }

    /// Greedy sampler, always picks the most likely token
    pub fn greedy() -> Self {
        Self::new(0.0, 0, 1.0, 1.0, 1)
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 0.01
    }

    /// Pick the next token from `logits`, penalizing tokens already in `history`
    pub fn sample(&mut self, logits: &[f32], history: &[TokenId]) -> Result<TokenId, SamplingError> {
        if logits.is_empty() {
            return Err(SamplingError::EmptyDistribution);
        }

        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .collect();
        if candidates.is_empty() {
            return Err(SamplingError::NoFiniteLogits);
        }

        if (self.repeat_penalty - 1.0).abs() > f32::EPSILON {
            for (id, logit) in candidates.iter_mut() {
                if history.iter().any(|&t| t as usize == *id) {
                    *logit = if *logit > 0.0 {
                        *logit / self.repeat_penalty
                    } else {
                        *logit * self.repeat_penalty
                    };
                }
            }
        }

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        if self.is_greedy() {
            return Ok(candidates[0].0 as TokenId);
        }

        if self.top_k > 0 && self.top_k < candidates.len() {
            candidates.truncate(self.top_k);
        }

        // softmax over the survivors
        let max = candidates[0].1;
        let mut probs: Vec<(usize, f32)> = candidates
            .iter()
            .map(|&(id, l)| (id, ((l - max) / self.temperature).exp()))
            .collect();
        let sum: f32 = probs.iter().map(|(_, p)| p).sum();
        for (_, p) in probs.iter_mut() {
            *p /= sum;
        }

        if self.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, (_, p)) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.top_p {
                    keep = i + 1;
                    break;
                }
            }
            probs.truncate(keep);
        }

        let total: f32 = probs.iter().map(|(_, p)| p).sum();
        let mut target = self.rng.next_f32() * total;
        for &(id, p) in &probs {
            if target < p {
                return Ok(id as TokenId);
            }
            target -= p;
        }
        // float rounding fell off the end
        Ok(probs[probs.len() - 1].0 as TokenId)
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish()
}
