//! Two-stage retriever: vector recall, then rerank
//!
//! Stage 1 embeds the question and pulls `initial_k` candidates for one
//! container from the index. Stage 2 reranks them and keeps the best `k`.
//! A failed or empty rerank falls back to the first `k` stage-1 results.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Embedder, Reranker};
use crate::core::{ChunkMetadata, LogLevel, QueryFilter, QueryHit, SemanticIndex};
use crate::error::{Error, Result};

/// Retrieval knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalOptions {
    /// Stage-1 candidates when reranking
    pub initial_k: usize,
    /// Default number of final results
    pub final_k: usize,
    pub use_reranking: bool,
    /// Characters kept in reference previews
    pub preview_chars: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            initial_k: 20,
            final_k: 8,
            use_reranking: true,
            preview_chars: 100,
        }
    }
}

/// A selected chunk with its scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Stage-1 cosine distance
    pub distance: f32,
    /// Present only when the document survived reranking
    pub rerank_score: Option<f32>,
}

impl From<QueryHit> for RetrievedDocument {
    fn from(hit: QueryHit) -> Self {
        Self {
            id: hit.id,
            text: hit.text,
            metadata: hit.metadata,
            distance: hit.distance,
            rerank_score: None,
        }
    }
}

/// Citation material returned alongside an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    /// 1-based position in the prompt
    pub id: usize,
    pub timestamp: DateTime<Utc>,
    pub log_level: LogLevel,
    pub container_name: String,
    pub text_preview: String,
    pub distance: Option<f32>,
    pub rerank_score: Option<f32>,
    pub severity_score: f32,
    pub has_error: bool,
    pub has_warning: bool,
}

pub struct Retriever {
    index: Arc<SemanticIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    options: RetrievalOptions,
}

impl Retriever {
    pub fn new(
        index: Arc<SemanticIndex>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            index,
            embedder,
            reranker,
            options,
        }
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }

    /// Best `k` chunks of `container_id` for `question`.
    ///
    /// An empty result means nothing relevant is indexed. Only a failed
    /// question embedding or index query is an error.
    pub async fn retrieve_context(
        &self,
        container_id: &str,
        question: &str,
        k: usize,
        use_reranking: bool,
        level: Option<LogLevel>,
    ) -> Result<Vec<RetrievedDocument>> {
        let rerank = use_reranking && self.reranker.is_some();
        let initial_k = if rerank { self.options.initial_k.max(k) } else { k };

        info!(container_id, k, rerank, level = ?level, "Retrieving context");

        let embedder = Arc::clone(&self.embedder);
        let q = question.to_string();
        let query_vector = tokio::task::spawn_blocking(move || embedder.embed(&q))
            .await?
            .map_err(|e| Error::collaborator("embedding", e))?;

        let index = Arc::clone(&self.index);
        let filter = QueryFilter::container(container_id).with_level(level);
        let candidates: Vec<RetrievedDocument> = tokio::task::spawn_blocking(move || {
            index.query_similar(&query_vector, &filter, initial_k)
        })
        .await??
        .into_iter()
        .map(RetrievedDocument::from)
        .collect();

        debug!(container_id, candidates = candidates.len(), "Stage-1 recall");

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        match &self.reranker {
            Some(reranker) if rerank && candidates.len() > 1 => {
                Ok(self.rerank(Arc::clone(reranker), question, candidates, k).await)
            }
            _ => Ok(truncated(candidates, k)),
        }
    }

    /// Error-level chunks only
    pub async fn retrieve_errors(
        &self,
        container_id: &str,
        question: &str,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        self.retrieve_context(container_id, question, k, false, Some(LogLevel::Error))
            .await
    }

    /// Never fails: any rerank problem yields the first `k` candidates unchanged
    async fn rerank(
        &self,
        reranker: Arc<dyn Reranker>,
        question: &str,
        candidates: Vec<RetrievedDocument>,
        k: usize,
    ) -> Vec<RetrievedDocument> {
        let texts: Vec<String> = candidates.iter().map(|d| d.text.clone()).collect();
        let q = question.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            reranker.rerank(&q, &refs, k)
        })
        .await;

        let mut hits = match outcome {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                warn!(error = %format!("{e:#}"), "Rerank failed, using similarity order");
                return truncated(candidates, k);
            }
            Err(e) => {
                warn!(error = %e, "Rerank task failed, using similarity order");
                return truncated(candidates, k);
            }
        };

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut taken = HashSet::new();
        let selected: Vec<RetrievedDocument> = hits
            .into_iter()
            .filter(|hit| taken.insert(hit.index))
            .filter_map(|hit| {
                candidates.get(hit.index).map(|doc| RetrievedDocument {
                    rerank_score: Some(hit.score),
                    ..doc.clone()
                })
            })
            .take(k)
            .collect();

        if selected.is_empty() {
            warn!("Rerank returned no usable results, using similarity order");
            return truncated(candidates, k);
        }

        debug!(
            selected = selected.len(),
            top_score = selected[0].rerank_score.unwrap_or_default(),
            "Reranked"
        );
        selected
    }
}

fn truncated(mut docs: Vec<RetrievedDocument>, k: usize) -> Vec<RetrievedDocument> {
    docs.truncate(k);
    docs
}

/// Prompt listing each document, then the question and instructions
pub fn build_prompt(docs: &[RetrievedDocument], question: &str) -> String {
    let context = docs
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            let score = doc
                .rerank_score
                .map(|s| format!(" (relevance: {s:.3})"))
                .unwrap_or_default();
            format!(
                "Log {} (timestamp: {}, level: {}, container: {}){}:\n{}",
                i + 1,
                doc.metadata.timestamp.to_rfc3339(),
                doc.metadata.log_level,
                doc.metadata.container_name(),
                score,
                doc.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are an expert Docker log analyst. Analyze the following container logs and answer the user's question with specific references to log entries.

Log Context:
{context}

Question: {question}

Instructions:
1. Analyze the logs systematically, looking for patterns and issues
2. Provide specific timestamps and log entries when referencing information
3. If the logs contain errors, explain what went wrong and potential causes
4. If the information is not in the logs, say so clearly
5. Be concise but thorough in your analysis
6. Consider log levels (error, warn, info, debug) when analyzing severity
7. Be brief and to the point.

Answer for the question according to the context provided:"
    )
}

/// One reference per document, in selection order
pub fn extract_references(docs: &[RetrievedDocument], preview_chars: usize) -> Vec<Reference> {
    docs.iter()
        .enumerate()
        .map(|(i, doc)| Reference {
            id: i + 1,
            timestamp: doc.metadata.timestamp,
            log_level: doc.metadata.log_level,
            container_name: doc.metadata.container_name().to_string(),
            text_preview: preview(&doc.text, preview_chars),
            distance: Some(doc.distance),
            rerank_score: doc.rerank_score,
            severity_score: doc.metadata.severity_score,
            has_error: doc.metadata.has_error,
            has_warning: doc.metadata.has_warning,
        })
        .collect()
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
