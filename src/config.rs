//! Bridge configuration
//!
//! Persisted as `config.json` in the platform data directory.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generation::GenerationParams;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to determine data directory: {0}")]
    DataDir(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Undelivered token events one task may have before it fails
    pub event_queue_depth: usize,
    /// Sessions that may be loaded at the same time
    pub max_sessions: usize,
    /// Finished task records kept for status queries and late cancels
    pub retained_tasks: usize,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Prompt evaluation batch size
    pub batch_size: usize,
    /// Defaults offered to callers that don't bring their own parameters
    pub generation: GenerationParams,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            event_queue_depth: 1024,
            max_sessions: 4,
            retained_tasks: 256,
            gpu_layers: 99, // Offload all layers to GPU by default
            batch_size: 512,
            generation: GenerationParams::default(),
        }
    }
}

impl BridgeConfig {
    /// Clamp every value into a usable range
    pub fn validate(&mut self) {
        let defaults = Self::default();
        if self.event_queue_depth == 0 {
            self.event_queue_depth = defaults.event_queue_depth;
        }
        if self.max_sessions == 0 {
            self.max_sessions = defaults.max_sessions;
        }
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }

        let generation = &mut self.generation;
        let fallback = GenerationParams::default();
        if generation.max_tokens == 0 {
            generation.max_tokens = fallback.max_tokens;
        }
        generation.temperature = if generation.temperature.is_finite() {
            generation.temperature.clamp(0.0, 2.0)
        } else {
            fallback.temperature
        };
        if !(generation.top_p > 0.0) {
            generation.top_p = fallback.top_p;
        } else if generation.top_p > 1.0 {
            generation.top_p = 1.0;
        }
        if !(generation.repeat_penalty.is_finite() && generation.repeat_penalty > 0.0) {
            generation.repeat_penalty = fallback.repeat_penalty;
        }
        generation.stop_sequences.retain(|stop| !stop.is_empty());
    }
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("com", "llamabridge", "llamabridge")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| ConfigError::DataDir("Could not determine home directory".to_string()))
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(get_data_dir()?.join("config.json"))
}

/// Load the config from the data directory.
///
/// Returns defaults if the file doesn't exist or is corrupted.
pub fn load_config() -> BridgeConfig {
    match config_path().and_then(|path| load_config_from(&path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            BridgeConfig::default()
        }
    }
}

pub fn load_config_from(path: &Path) -> Result<BridgeConfig, ConfigError> {
    if !path.exists() {
        tracing::info!("Config file not found, using defaults");
        return Ok(BridgeConfig::default());
    }

    let json = fs::read_to_string(path)?;
    let mut config: BridgeConfig = serde_json::from_str(&json)?;
    config.validate();

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

pub fn save_config(config: &BridgeConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_path()?)
}

pub fn save_config_to(config: &BridgeConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::debug!("Saved config to {}", path.display());
    Ok(())
}
