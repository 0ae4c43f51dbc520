//! Generation parameters

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::inference::Sampler;

/// Per-request generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Generation stops once the output contains any of these
    pub stop_sequences: Vec<String>,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Repetition penalty
    pub repeat_penalty: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            stop_sequences: Vec::new(),
            top_k: 40,
            top_p: 0.9,
            repeat_penalty: 1.1,
            seed: 0,
        }
    }
}

impl GenerationParams {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject values the decode loop cannot work with
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.max_tokens == 0 {
            return Err(BridgeError::InvalidArgument(
                "maxTokens must be positive".to_string(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(BridgeError::InvalidArgument(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(BridgeError::InvalidArgument(format!(
                "topP must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(BridgeError::InvalidArgument(format!(
                "repeatPenalty must be positive, got {}",
                self.repeat_penalty
            )));
        }
        if self.stop_sequences.iter().any(String::is_empty) {
            return Err(BridgeError::InvalidArgument(
                "stopSequences must not contain empty strings".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn sampler(&self) -> Sampler {
        Sampler::new(
            self.temperature,
            self.top_k,
            self.top_p,
            self.repeat_penalty,
            self.seed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_params_default() {
        let params = GenerationParams::default();
        assert_eq!(params.max_tokens, 512);
        assert!((params.temperature - 0.7).abs() < 0.001);
        assert_eq!(params.top_k, 40);
        assert!((params.top_p - 0.9).abs() < 0.001);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let params: GenerationParams =
            serde_json::from_str(r#"{"maxTokens":5,"stopSequences":["\n\n"]}"#).unwrap();
        assert_eq!(params.max_tokens, 5);
        assert_eq!(params.stop_sequences, vec!["\n\n".to_string()]);
        assert_eq!(params.top_k, 40);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = GenerationParams::default().with_max_tokens(0);
        assert!(matches!(zero.validate(), Err(BridgeError::InvalidArgument(_))));

        let hot = GenerationParams::default().with_temperature(f32::NAN);
        assert!(hot.validate().is_err());

        let negative = GenerationParams::default().with_temperature(-0.5);
        assert!(negative.validate().is_err());

        let empty_stop = GenerationParams::default().with_stop_sequence("");
        assert!(empty_stop.validate().is_err());

        let greedy = GenerationParams::default().with_temperature(0.0);
        assert!(greedy.validate().is_ok());
    }
}
