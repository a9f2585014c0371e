//! Rerank collaborator
//!
//! Scores already-recalled candidates against the query. Results carry the
//! candidate's original position so callers can map them back.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::post_json;
use crate::retry::{with_retry, RetryPolicy};

/// One scored candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankHit {
    pub text: String,
    pub score: f32,
    /// Position in the `documents` slice passed to `rerank`
    pub index: usize,
}

/// Trait for rerank implementations
pub trait Reranker: Send + Sync {
    /// Up to `top_k` hits, best first
    fn rerank(&self, query: &str, documents: &[&str], top_k: usize) -> Result<Vec<RerankHit>>;

    fn model(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    data: Vec<RerankItem>,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f32,
    #[serde(default)]
    document: Option<String>,
}

/// Voyage-compatible `/rerank` endpoint
pub struct HttpReranker {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpReranker {
    pub fn new(endpoint: &str, model: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    pub fn voyage(model: &str) -> Self {
        Self::new("https://api.voyageai.com/v1/rerank", model)
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
}

impl Reranker for HttpReranker {
    fn rerank(&self, query: &str, documents: &[&str], top_k: usize) -> Result<Vec<RerankHit>> {
        if documents.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let payload = serde_json::json!({
            "query": query,
            "documents": documents,
            "model": self.model,
            "top_k": top_k.min(documents.len()),
        });

        let auth = self.api_key.as_ref().map(|k| format!("Bearer {k}"));
        let headers: Vec<(&str, &str)> = auth
            .as_deref()
            .map(|a| vec![("Authorization", a)])
            .unwrap_or_default();

        let json = with_retry(&self.retry, "rerank", || {
            post_json(&self.endpoint, &headers, self.timeout, &payload)
        })
        .context("Failed to send rerank request")?;

        let response: RerankResponse =
            serde_json::from_value(json).context("Failed to parse rerank response")?;

        let mut hits: Vec<RerankHit> = response
            .data
            .into_iter()
            .map(|item| RerankHit {
                text: item.document.unwrap_or_else(|| {
                    documents
                        .get(item.index)
                        .map(|d| d.to_string())
                        .unwrap_or_default()
                }),
                score: item.relevance_score,
                index: item.index,
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);

        debug!(candidates = documents.len(), returned = hits.len(), "Reranked");
        Ok(hits)
    }

    fn model(&self) -> &str {
        &self.model
    }
}
