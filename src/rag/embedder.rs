//! Embedder - text to fixed-dimension vectors
//!
//! - `HttpEmbedder`: OpenAI/Voyage-compatible `/embeddings` endpoint
//! - `HashEmbedder`: offline feature hashing with Blake3, deterministic

use std::time::Duration;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::debug;

use super::post_json;
use crate::retry::{with_retry, RetryPolicy};

// ============================================================================
// Embedder Trait
// ============================================================================

/// Trait for embedding implementations
pub trait Embedder: Send + Sync {
    /// Embed a single query text
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of documents; one vector per input, in order
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Get embedding dimension
    fn dimension(&self) -> usize;

    /// Get backend name
    fn backend(&self) -> &str;
}

// ============================================================================
// Hash Embedder (offline)
// ============================================================================

/// Bag-of-words feature hashing: each lowercased word adds ±1 to a
/// Blake3-chosen slot. Texts sharing words land close together.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn bump(&self, vector: &mut [f32], token: &[u8]) {
        let hash = blake3::hash(token);
        let bytes = hash.as_bytes();
        let slot = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]) as usize
            % self.dimension;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign;
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let mut any = false;

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.bump(&mut vector, word.to_lowercase().as_bytes());
            any = true;
        }

        // Punctuation-only text still gets a stable direction
        if !any && !text.is_empty() {
            self.bump(&mut vector, text.as_bytes());
        }

        // Normalize
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        Ok(vector)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.par_iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend(&self) -> &str {
        "blake3-hash"
    }
}

// ============================================================================
// HTTP Embedder (Voyage / OpenAI compatible)
// ============================================================================

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Embedder using an `/embeddings` HTTP API
pub struct HttpEmbedder {
    endpoint: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
    send_input_type: bool,
}

impl HttpEmbedder {
    pub fn new(endpoint: &str, model: &str, dimension: usize) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            dimension,
            api_key: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            send_input_type: endpoint.contains("voyageai"),
        }
    }

    /// Voyage AI hosted embeddings
    pub fn voyage(model: &str, dimension: usize) -> Self {
        Self::new("https://api.voyageai.com/v1/embeddings", model, dimension)
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, texts: &[&str], input_type: &str) -> Result<Vec<Vec<f32>>> {
        let mut payload = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        if self.send_input_type {
            payload["input_type"] = serde_json::Value::from(input_type);
        }

        let auth = self.api_key.as_ref().map(|k| format!("Bearer {k}"));
        let headers: Vec<(&str, &str)> = auth
            .as_deref()
            .map(|a| vec![("Authorization", a)])
            .unwrap_or_default();

        let json = with_retry(&self.retry, "embeddings", || {
            post_json(&self.endpoint, &headers, self.timeout, &payload)
        })
        .context("Failed to send embedding request")?;

        let response: EmbeddingResponse =
            serde_json::from_value(json).context("Failed to parse embedding response")?;

        let mut items = response.data;
        if items.len() != texts.len() {
            bail!(
                "embedding service returned {} vectors for {} inputs",
                items.len(),
                texts.len()
            );
        }
        if items.iter().all(|i| i.index.is_some()) {
            items.sort_by_key(|i| i.index);
        }

        let vectors: Vec<Vec<f32>> = items.into_iter().map(|i| i.embedding).collect();
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            bail!(
                "embedding dimension {} does not match configured {}",
                bad.len(),
                self.dimension
            );
        }

        debug!(count = vectors.len(), model = %self.model, "Embeddings generated");
        Ok(vectors)
    }
}

impl Embedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(&[text], "query")?
            .pop()
            .context("Empty embedding response")
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts, "document")
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend(&self) -> &str {
        "http"
    }
}
