//! SemanticIndex - key → (vector, text, metadata) store with filtered k-NN
//!
//! Internally synchronized: streamers upsert and retrievers query through a
//! shared `Arc<SemanticIndex>` without external locking. Each upsert is
//! applied under one write lock, so a batch becomes visible all at once.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::{ChunkMetadata, LogChunk, LogLevel};

/// Errors raised by the index
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("got {chunks} chunks but {vectors} vectors")]
    LengthMismatch { chunks: usize, vectors: usize },

    #[error("vector dimension {got} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("failed to persist index to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index snapshot codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unsupported index snapshot version {0}")]
    Version(u32),
}

/// Equality filters applied before ranking
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub container_id: Option<String>,
    pub log_level: Option<LogLevel>,
}

impl QueryFilter {
    pub fn container(container_id: impl Into<String>) -> Self {
        Self {
            container_id: Some(container_id.into()),
            log_level: None,
        }
    }

    pub fn with_level(mut self, level: Option<LogLevel>) -> Self {
        self.log_level = level;
        self
    }

    fn matches(&self, metadata: &ChunkMetadata) -> bool {
        self.container_id
            .as_deref()
            .map_or(true, |id| metadata.container_id == id)
            && self.log_level.map_or(true, |lvl| metadata.log_level == lvl)
    }
}

/// One k-NN result
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Cosine distance (0 = identical direction, 2 = opposite)
    pub distance: f32,
}

/// Aggregate counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_chunks: usize,
    pub per_container: BTreeMap<String, usize>,
    pub per_level: BTreeMap<LogLevel, usize>,
    pub dimension: Option<usize>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    text: String,
    vector: Vec<f32>,
    metadata: ChunkMetadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexData {
    version: u32,
    dimension: Option<usize>,
    updated_at: Option<DateTime<Utc>>,
    entries: Vec<IndexEntry>,
    /// Chunk id to entry position
    #[serde(skip)]
    by_id: HashMap<String, usize>,
}

impl IndexData {
    fn rebuild_lookup(&mut self) {
        self.by_id = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
    }
}

/// The semantic index
pub struct SemanticIndex {
    data: RwLock<IndexData>,
    path: Option<PathBuf>,
    /// Serializes snapshot writes so the newest state always lands last
    persist_lock: Mutex<()>,
}

impl SemanticIndex {
    const VERSION: u32 = 1;

    /// Volatile index, nothing written to disk
    pub fn in_memory() -> Self {
        Self {
            data: RwLock::new(IndexData {
                version: Self::VERSION,
                ..Default::default()
            }),
            path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Open a durable index, loading the snapshot at `path` if one exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let data = if path.exists() {
            let file = File::open(&path).map_err(|source| IndexError::Persist {
                path: path.clone(),
                source,
            })?;
            let mut data: IndexData = bincode::deserialize_from(BufReader::new(file))?;
            if data.version != Self::VERSION {
                return Err(IndexError::Version(data.version));
            }
            data.rebuild_lookup();
            info!(path = %path.display(), chunks = data.entries.len(), "Loaded semantic index");
            data
        } else {
            IndexData {
                version: Self::VERSION,
                ..Default::default()
            }
        };

        Ok(Self {
            data: RwLock::new(data),
            path: Some(path),
            persist_lock: Mutex::new(()),
        })
    }

    /// Snapshot location, if durable
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or overwrite chunks by id.
    ///
    /// Requires one vector per chunk, all of the index dimension. Nothing is
    /// applied if validation fails.
    pub fn upsert(&self, chunks: &[LogChunk], vectors: &[Vec<f32>]) -> Result<usize, IndexError> {
        if chunks.len() != vectors.len() {
            return Err(IndexError::LengthMismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        {
            let mut data = self.data.write();

            let expected = data.dimension.unwrap_or(vectors[0].len());
            if let Some(bad) = vectors.iter().find(|v| v.len() != expected || v.is_empty()) {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    got: bad.len(),
                });
            }
            data.dimension = Some(expected);

            for (chunk, vector) in chunks.iter().zip(vectors) {
                let entry = IndexEntry {
                    id: chunk.id.clone(),
                    text: chunk.text.clone(),
                    vector: vector.clone(),
                    metadata: chunk.metadata.clone(),
                };
                match data.by_id.get(&chunk.id).copied() {
                    Some(pos) => data.entries[pos] = entry,
                    None => {
                        let pos = data.entries.len();
                        data.by_id.insert(chunk.id.clone(), pos);
                        data.entries.push(entry);
                    }
                }
            }
            data.updated_at = Some(Utc::now());
        }

        debug!(count = chunks.len(), "Upserted chunks");
        self.persist()?;
        Ok(chunks.len())
    }

    /// Up to `k` entries passing `filter`, nearest first
    pub fn query_similar(
        &self,
        vector: &[f32],
        filter: &QueryFilter,
        k: usize,
    ) -> Result<Vec<QueryHit>, IndexError> {
        let data = self.data.read();

        if let Some(expected) = data.dimension {
            if vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = data
            .entries
            .par_iter()
            .enumerate()
            .filter(|(_, e)| filter.matches(&e.metadata))
            .map(|(i, e)| (i, cosine_distance(vector, &e.vector)))
            .collect();

        // Insertion position breaks ties, keeping equal distances in a stable order
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, distance)| {
                let e = &data.entries[i];
                QueryHit {
                    id: e.id.clone(),
                    text: e.text.clone(),
                    metadata: e.metadata.clone(),
                    distance,
                }
            })
            .collect())
    }

    /// Remove every chunk of a container, returning how many were dropped
    pub fn delete(&self, container_id: &str) -> Result<usize, IndexError> {
        let removed = {
            let mut data = self.data.write();
            let before = data.entries.len();
            data.entries.retain(|e| e.metadata.container_id != container_id);
            let removed = before - data.entries.len();
            if removed > 0 {
                data.rebuild_lookup();
                data.updated_at = Some(Utc::now());
            }
            removed
        };

        if removed > 0 {
            info!(container_id, removed, "Deleted container chunks");
            self.persist()?;
        }
        Ok(removed)
    }

    /// Fetch one chunk by id
    pub fn get(&self, id: &str) -> Option<LogChunk> {
        let data = self.data.read();
        data.by_id.get(id).map(|&pos| {
            let e = &data.entries[pos];
            LogChunk {
                id: e.id.clone(),
                text: e.text.clone(),
                metadata: e.metadata.clone(),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.data.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().entries.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        let data = self.data.read();
        let mut stats = IndexStats {
            total_chunks: data.entries.len(),
            dimension: data.dimension,
            updated_at: data.updated_at,
            ..Default::default()
        };
        for entry in &data.entries {
            *stats
                .per_container
                .entry(entry.metadata.container_id.clone())
                .or_insert(0) += 1;
            *stats.per_level.entry(entry.metadata.log_level).or_insert(0) += 1;
        }
        stats
    }

    /// Write the current state to disk (no-op for in-memory indexes)
    fn persist(&self) -> Result<(), IndexError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock();

        let io_err = |source| IndexError::Persist {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        // Atomic write: write to temp, then rename
        let temp_path = path.with_extension("tmp");
        {
            let data = self.data.read();
            let file = File::create(&temp_path).map_err(io_err)?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, &*data)?;
            writer.flush().map_err(io_err)?;
        }
        fs::rename(&temp_path, path).map_err(io_err)?;
        Ok(())
    }
}

/// 1 - cosine similarity; zero vectors are maximally distant
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 2.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        2.0
    } else {
        1.0 - dot / (norm_a * norm_b)
    }
}
