//! Model descriptors and load-time validation
//!
//! Describes which model to load and checks GGUF headers before the native
//! loader touches the file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Default context window when a descriptor does not specify one
pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;

/// Errors that prevent a model from being loaded.
///
/// A load that fails with any of these never creates a session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelLoadError {
    #[error("Model file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Unsupported model format: {0}")]
    Format(String),

    #[error("Out of memory while loading model: {0}")]
    OutOfMemory(String),

    #[error("Failed to initialize backend: {0}")]
    Backend(String),

    #[error("Engine worker failed: {0}")]
    Worker(String),
}

/// Errors raised while reading a GGUF header
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

impl ModelError {
    /// Convert into the load error reported to callers
    pub fn into_load_error(self, path: &Path) -> ModelLoadError {
        match self {
            ModelError::FileOpen(e) if e.kind() == io::ErrorKind::NotFound => {
                ModelLoadError::FileNotFound(path.to_path_buf())
            }
            other => ModelLoadError::Format(other.to_string()),
        }
    }
}

/// What to load. Immutable once a session has been created from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    /// Path to the model file
    pub path: PathBuf,
    /// Context window size in tokens
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    /// Quantization or format tag, e.g. "Q4_K_M"
    #[serde(default)]
    pub quantization: Option<String>,
    /// Layers to offload to GPU; falls back to the bridge config when unset
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    /// Display name; defaults to the file stem
    #[serde(default)]
    pub name: Option<String>,
}

fn default_context_size() -> u32 {
    DEFAULT_CONTEXT_SIZE
}

impl ModelDescriptor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            context_size: DEFAULT_CONTEXT_SIZE,
            quantization: None,
            gpu_layers: None,
            name: None,
        }
    }

    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Some(quantization.into());
        self
    }

    pub fn with_gpu_layers(mut self, gpu_layers: u32) -> Self {
        self.gpu_layers = Some(gpu_layers);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name shown to callers: explicit name, else file stem, else the full path
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.path.to_string_lossy().to_string())
    }
}

/// Model information reported once the engine has loaded a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedModelInfo {
    /// Display name
    pub name: String,
    /// Path to the loaded model
    pub path: String,
    /// Quantization tag from the descriptor, if any
    pub quantization: Option<String>,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Context window actually allocated
    pub context_length: u32,
    /// Model size in bytes
    pub size_bytes: u64,
    /// When loading finished
    pub loaded_at: DateTime<Utc>,
}

impl LoadedModelInfo {
    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        let bytes = self.size_bytes as f64;

        if bytes < 1024.0 {
            format!("{} B", bytes)
        } else if bytes < 1024.0 * 1024.0 {
            format!("{:.2} KB", bytes / 1024.0)
        } else if bytes < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MB", bytes / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; 24];
    file.read_exact(&mut header)?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    // GGUF v2 and v3 are supported
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(count);
    count.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(count);

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}
