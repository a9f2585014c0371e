//! DockLens service - the outward-facing query and diagnostics surface

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{IndexStats, LogLevel, SemanticIndex};
use crate::error::{Error, Result};
use crate::ingest::{StreamerStats, WatcherMonitor, WatcherStats};
use crate::rag::{build_prompt, extract_references, Completer, Reference, RetrievalOptions, Retriever};
use crate::runtime::{Container, ContainerRuntime};

/// Starter questions offered to users
pub const QUERY_SUGGESTIONS: [&str; 8] = [
    "What errors occurred in the logs?",
    "Show me the startup sequence",
    "What are the most recent log entries?",
    "Are there any warning messages?",
    "What processes are running?",
    "Show me network-related logs",
    "What configuration changes were made?",
    "Are there any performance issues?",
];

/// Answer used when recall finds nothing
pub const NO_DATA_ANSWER: &str = "No relevant log data found for this question. The container might not have any logs or the question doesn't match the available log content.";

/// Per-query overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Final result count; `final_k` when unset
    pub k: Option<usize>,
    /// Overrides the configured reranking switch
    pub use_reranking: Option<bool>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub references: Vec<Reference>,
    pub container_id: String,
    pub question: String,
}

/// Index contents plus the active retrieval setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalStats {
    pub index: IndexStats,
    pub retrieval: RetrievalOptions,
    pub reranker_configured: bool,
    pub completion_model: String,
}

pub struct DockLens {
    index: Arc<SemanticIndex>,
    runtime: Arc<dyn ContainerRuntime>,
    retriever: Retriever,
    completer: Arc<dyn Completer>,
    monitor: WatcherMonitor,
}

impl DockLens {
    pub fn new(
        index: Arc<SemanticIndex>,
        runtime: Arc<dyn ContainerRuntime>,
        retriever: Retriever,
        completer: Arc<dyn Completer>,
    ) -> Self {
        Self {
            index,
            runtime,
            retriever,
            completer,
            monitor: WatcherMonitor::default(),
        }
    }

    /// Report streamer and watcher state from a running watcher
    pub fn with_monitor(mut self, monitor: WatcherMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn index(&self) -> &Arc<SemanticIndex> {
        &self.index
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Answer `question` from the logs of `container_id`
    pub async fn query(&self, container_id: &str, question: &str, k: usize) -> Result<QueryResponse> {
        self.query_with(
            container_id,
            question,
            &QueryOptions {
                k: Some(k),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn query_with(
        &self,
        container_id: &str,
        question: &str,
        options: &QueryOptions,
    ) -> Result<QueryResponse> {
        let k = options.k.unwrap_or(self.retriever.options().final_k);
        let use_reranking = options
            .use_reranking
            .unwrap_or(self.retriever.options().use_reranking);

        let docs = self
            .retriever
            .retrieve_context(container_id, question, k, use_reranking, options.level)
            .await?;

        if docs.is_empty() {
            warn!(container_id, "No relevant documents found");
            return Ok(QueryResponse {
                answer: NO_DATA_ANSWER.to_string(),
                references: Vec::new(),
                container_id: container_id.to_string(),
                question: question.to_string(),
            });
        }

        let prompt = build_prompt(&docs, question);
        let completer = Arc::clone(&self.completer);
        let answer = tokio::task::spawn_blocking(move || completer.complete(&prompt))
            .await?
            .map_err(|e| Error::collaborator("completion", e))?;

        let references = extract_references(&docs, self.retriever.options().preview_chars);

        info!(
            container_id,
            references = references.len(),
            answer_chars = answer.len(),
            "Query answered"
        );

        Ok(QueryResponse {
            answer,
            references,
            container_id: container_id.to_string(),
            question: question.to_string(),
        })
    }

    pub fn get_active_streamers(&self) -> BTreeMap<String, StreamerStats> {
        self.monitor.get_active_streamers()
    }

    pub fn get_watcher_stats(&self) -> WatcherStats {
        self.monitor.get_watcher_stats()
    }

    pub fn retrieval_stats(&self) -> RetrievalStats {
        RetrievalStats {
            index: self.index.stats(),
            retrieval: self.retriever.options().clone(),
            reranker_configured: self.retriever.has_reranker(),
            completion_model: self.completer.model().to_string(),
        }
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<Container>> {
        let runtime = Arc::clone(&self.runtime);
        tokio::task::spawn_blocking(move || runtime.list_containers(all)).await?
    }

    pub async fn get_container(&self, container_id: &str) -> Result<Container> {
        let runtime = Arc::clone(&self.runtime);
        let id = container_id.to_string();
        tokio::task::spawn_blocking(move || runtime.get_container(&id)).await?
    }

    /// Drop every indexed chunk of a container
    pub async fn purge(&self, container_id: &str) -> Result<usize> {
        let index = Arc::clone(&self.index);
        let id = container_id.to_string();
        Ok(tokio::task::spawn_blocking(move || index.delete(&id)).await??)
    }
}
