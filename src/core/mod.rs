//! Core module - log chunk data model and the semantic index
//!
//! A [`LogChunk`] is immutable once built: the streamer creates it at flush
//! time, the index stores it, the retriever reads it back.

pub mod index;

pub use index::{cosine_distance, IndexError, IndexStats, QueryFilter, QueryHit, SemanticIndex};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classified log level of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub const ALL: [LogLevel; 4] = [LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug];

    /// Severity weight used for ranking by importance
    pub fn severity(&self) -> f32 {
        match self {
            LogLevel::Error => 1.0,
            LogLevel::Warn => 0.7,
            LogLevel::Info => 0.3,
            LogLevel::Debug => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Container fields captured when a chunk is flushed.
///
/// Not live-updated: a chunk keeps the state the container had at flush time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub name: String,
    pub status: String,
    pub image: String,
    pub created: String,
    pub started: String,
    pub command: Vec<String>,
    pub ports: Vec<String>,
    /// Environment variable names only; values are never indexed
    pub env_keys: Vec<String>,
    pub working_dir: String,
    pub user: String,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
}

impl ContainerSnapshot {
    /// Placeholder used when the runtime cannot describe the container
    pub fn unknown() -> Self {
        Self {
            name: "unknown".to_string(),
            status: "unknown".to_string(),
            image: "unknown".to_string(),
            ..Default::default()
        }
    }
}

/// Typed chunk metadata: the fields retrieval and prompting depend on,
/// plus one open extension map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub container_id: String,
    pub timestamp: DateTime<Utc>,
    /// Running chunk counter of the streamer that produced this chunk
    pub sequence: u64,
    /// Position within its flush batch
    pub chunk_index: usize,
    /// Number of chunks produced by the same flush
    pub total_chunks: usize,
    pub line_count: usize,
    pub char_count: usize,
    pub log_level: LogLevel,
    pub severity_score: f32,
    pub has_error: bool,
    pub has_warning: bool,
    pub error_count: usize,
    pub warning_count: usize,
    pub container: ContainerSnapshot,
    pub extra: BTreeMap<String, String>,
}

impl ChunkMetadata {
    pub fn container_name(&self) -> &str {
        &self.container.name
    }
}

/// An indexed span of log text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Globally unique chunk id
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl LogChunk {
    /// Build a chunk id that stays readable in logs: short container id + random suffix
    pub fn new_id(container_id: &str) -> String {
        let short: String = container_id.chars().take(12).collect();
        format!("{}_{}", short, uuid::Uuid::new_v4().simple())
    }

    pub fn container_id(&self) -> &str {
        &self.metadata.container_id
    }

    pub fn level(&self) -> LogLevel {
        self.metadata.log_level
    }
}
