//! Configuration Module - settings from ~/.docklens/config.toml
//!
//! Supports:
//! - Chunking thresholds and streamer channel size
//! - Retrieval depth and reranking
//! - Embedding, rerank and completion endpoints (keys come from env vars)
//! - Index location and docker binary

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::ingest::{ChunkPolicy, StreamerConfig};
use crate::rag::{
    api_key_from_env, Completer, Embedder, GeminiCompleter, HashEmbedder, HttpEmbedder,
    HttpReranker, Reranker, RetrievalOptions,
};
use crate::retry::RetryPolicy;

/// DockLens Configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub index: IndexConfig,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub completion: CompletionConfig,
    pub runtime: RuntimeConfig,
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Buffering and splitting thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_lines: usize,
    pub timeout_seconds: u64,
    pub overlap_chars: usize,
    pub line_channel_capacity: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1500,
            min_chunk_size: 200,
            max_lines: 25,
            timeout_seconds: 30,
            overlap_chars: 200,
            line_channel_capacity: 1024,
        }
    }
}

impl ChunkingConfig {
    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            policy: ChunkPolicy {
                max_chunk_size: self.max_chunk_size,
                min_chunk_size: self.min_chunk_size,
                max_lines: self.max_lines,
                timeout: Duration::from_secs(self.timeout_seconds),
                overlap_chars: self.overlap_chars,
            },
            line_channel_capacity: self.line_channel_capacity,
        }
    }
}

/// Two-stage retrieval settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub initial_k: usize,
    pub final_k: usize,
    pub use_reranking: bool,
    pub preview_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let defaults = RetrievalOptions::default();
        Self {
            initial_k: defaults.initial_k,
            final_k: defaults.final_k,
            use_reranking: defaults.use_reranking,
            preview_chars: defaults.preview_chars,
        }
    }
}

impl RetrievalConfig {
    pub fn options(&self) -> RetrievalOptions {
        RetrievalOptions {
            initial_k: self.initial_k,
            final_k: self.final_k,
            use_reranking: self.use_reranking,
            preview_chars: self.preview_chars,
        }
    }
}

/// Semantic index location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Snapshot file; platform data dir when unset
    pub path: Option<PathBuf>,
}

impl IndexConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "tunclon", "docklens")
                .map(|dirs| dirs.data_dir().join("index.bin"))
                .unwrap_or_else(|| home_dir_fallback().join("index.bin"))
        })
    }
}

/// Embedding backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// OpenAI/Voyage-compatible HTTP service
    #[default]
    Http,
    /// Offline Blake3 feature hashing
    Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub dimension: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Http,
            endpoint: "https://api.voyageai.com/v1/embeddings".to_string(),
            model: "voyage-3".to_string(),
            api_key_env: "VOYAGE_API_KEY".to_string(),
            dimension: 1024,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl EmbeddingConfig {
    pub fn build(&self) -> Arc<dyn Embedder> {
        match self.backend {
            EmbeddingBackend::Hash => Arc::new(HashEmbedder::new(self.dimension)),
            EmbeddingBackend::Http => {
                let key = api_key_from_env(&self.api_key_env);
                if key.is_none() {
                    debug!(var = %self.api_key_env, "No embedding API key set");
                }
                Arc::new(
                    HttpEmbedder::new(&self.endpoint, &self.model, self.dimension)
                        .with_api_key(key)
                        .with_timeout(Duration::from_secs(self.timeout_secs))
                        .with_retry(RetryPolicy::default().with_attempts(self.max_retries + 1)),
                )
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://api.voyageai.com/v1/rerank".to_string(),
            model: "rerank-2.5".to_string(),
            api_key_env: "VOYAGE_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

impl RerankConfig {
    /// `None` when reranking is disabled
    pub fn build(&self) -> Option<Arc<dyn Reranker>> {
        if !self.enabled {
            return None;
        }
        Some(Arc::new(
            HttpReranker::new(&self.endpoint, &self.model)
                .with_api_key(api_key_from_env(&self.api_key_env))
                .with_timeout(Duration::from_secs(self.timeout_secs)),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: GeminiCompleter::DEFAULT_ENDPOINT.to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            max_tokens: 1000,
            temperature: 0.1,
            timeout_secs: 60,
        }
    }
}

impl CompletionConfig {
    pub fn build(&self) -> Arc<dyn Completer> {
        Arc::new(
            GeminiCompleter::new(&self.endpoint, &self.model)
                .with_api_key(api_key_from_env(&self.api_key_env))
                .with_generation(self.max_tokens, self.temperature)
                .with_timeout(Duration::from_secs(self.timeout_secs)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker CLI binary
    pub docker_bin: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
        }
    }
}

impl Config {
    /// Load config from default path or return defaults
    pub fn load() -> Self {
        Self::load_from(&Self::default_path()).unwrap_or_default()
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        Ok(config)
    }

    /// Explicit path must exist; the default path may be missing
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "tunclon", "docklens")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| home_dir_fallback().join("config.toml"))
    }

    /// Reject settings the streamer or retriever cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let c = &self.chunking;
        let r = &self.retrieval;

        let problem = if c.max_chunk_size == 0 {
            Some("chunking.max_chunk_size must be positive".to_string())
        } else if c.overlap_chars >= c.max_chunk_size {
            Some(format!(
                "chunking.overlap_chars ({}) must be smaller than max_chunk_size ({})",
                c.overlap_chars, c.max_chunk_size
            ))
        } else if c.min_chunk_size > c.max_chunk_size {
            Some(format!(
                "chunking.min_chunk_size ({}) exceeds max_chunk_size ({})",
                c.min_chunk_size, c.max_chunk_size
            ))
        } else if c.max_lines == 0 {
            Some("chunking.max_lines must be positive".to_string())
        } else if c.timeout_seconds == 0 {
            Some("chunking.timeout_seconds must be positive".to_string())
        } else if c.line_channel_capacity == 0 {
            Some("chunking.line_channel_capacity must be positive".to_string())
        } else if r.initial_k == 0 || r.final_k == 0 {
            Some("retrieval.initial_k and retrieval.final_k must be positive".to_string())
        } else if self.embedding.dimension == 0 {
            Some("embedding.dimension must be positive".to_string())
        } else {
            None
        };

        match problem {
            Some(message) => Err(Error::Config(message)),
            None => Ok(()),
        }
    }
}

fn home_dir_fallback() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docklens")
}

/// Generate a sample config file with comments
pub fn generate_sample_config() -> String {
    r#"# DockLens Configuration
# Location: ~/.config/docklens/config.toml (or %APPDATA%\tunclon\docklens\config\config.toml on Windows)

[general]
# Log level: trace, debug, info, warn, error
log_level = "info"

[chunking]
# Flush a container's buffer once it holds this many characters
max_chunk_size = 1500

# Timed flushes skip buffers smaller than this
min_chunk_size = 200

# Flush once this many lines are buffered
max_lines = 25

# Check the buffer at least this often (seconds)
timeout_seconds = 30

# Characters repeated at the start of the next chunk
overlap_chars = 200

# Lines queued between the docker reader and the chunker
line_channel_capacity = 1024

[retrieval]
# Candidates pulled from the index before reranking
initial_k = 20

# Results kept for the prompt
final_k = 8

use_reranking = true

# Characters shown per reference
preview_chars = 100

[index]
# Snapshot file (default: platform data dir)
# path = "/var/lib/docklens/index.bin"

[embedding]
# "http" (Voyage/OpenAI compatible) or "hash" (offline, no service needed)
backend = "http"
endpoint = "https://api.voyageai.com/v1/embeddings"
model = "voyage-3"
api_key_env = "VOYAGE_API_KEY"
dimension = 1024
timeout_secs = 30
max_retries = 3

[rerank]
enabled = true
endpoint = "https://api.voyageai.com/v1/rerank"
model = "rerank-2.5"
api_key_env = "VOYAGE_API_KEY"
timeout_secs = 30

[completion]
endpoint = "https://generativelanguage.googleapis.com/v1beta"
model = "gemini-2.5-flash"
api_key_env = "GEMINI_API_KEY"
max_tokens = 1000
temperature = 0.1
timeout_secs = 60

[runtime]
docker_bin = "docker"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chunking.max_chunk_size, 1500);
        assert_eq!(config.retrieval.initial_k, 20);
        assert_eq!(config.retrieval.final_k, 8);
        assert_eq!(config.embedding.model, "voyage-3");
        assert_eq!(config.completion.model, "gemini-2.5-flash");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test_config.toml");

        let mut config = Config::default();
        config.index.path = Some(dir.path().join("index.bin"));
        config.embedding.backend = EmbeddingBackend::Hash;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_parse_sample_config() {
        let sample = generate_sample_config();
        let config: Config = toml::from_str(&sample).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str("[chunking]\nmax_lines = 10\n").unwrap();
        assert_eq!(config.chunking.max_lines, 10);
        assert_eq!(config.chunking.max_chunk_size, 1500);
        assert!(config.rerank.enabled);
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let mut config = Config::default();
        config.chunking.overlap_chars = 1500;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.chunking.min_chunk_size = 2000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retrieval.final_k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_streamer_config() {
        let streamer = ChunkingConfig::default().streamer_config();
        assert_eq!(streamer.policy.timeout, Duration::from_secs(30));
        assert_eq!(streamer.policy.overlap_chars, 200);
        assert_eq!(streamer, StreamerConfig::default());
    }

    #[test]
    fn test_resolve_missing_explicit_path() {
        let dir = TempDir::new().unwrap();
        assert!(Config::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_rerank_disabled_builds_none() {
        let config = RerankConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(config.build().is_none());
    }
}
