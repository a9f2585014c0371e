//! RAG module - collaborators and the two-stage retriever
//!
//! - `embedder`: text → vector (HTTP service or offline hashing)
//! - `rerank`: second-pass relevance scoring
//! - `completion`: answer generation
//! - `retriever`: recall, rerank with fallback, prompt and reference assembly

pub mod completion;
pub mod embedder;
pub mod rerank;
pub mod retriever;

pub use completion::{Completer, GeminiCompleter};
pub use embedder::{Embedder, HashEmbedder, HttpEmbedder};
pub use rerank::{HttpReranker, RerankHit, Reranker};
pub use retriever::{
    build_prompt, extract_references, Reference, RetrievalOptions, RetrievedDocument, Retriever,
};

use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

/// HTTP-level failure, kept typed so the retry layer can classify it
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Read an API key from the environment, if the variable is set and non-empty
pub fn api_key_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// POST a JSON body and decode a JSON reply
pub(crate) fn post_json(
    url: &str,
    headers: &[(&str, &str)],
    timeout: Duration,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let mut request = ureq::post(url)
        .timeout(timeout)
        .set("Content-Type", "application/json");
    for (name, value) in headers {
        request = request.set(name, value);
    }

    let response = match request.send_json(body) {
        Ok(response) => response,
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            return Err(HttpError::Status { code, body }.into());
        }
        Err(ureq::Error::Transport(t)) => return Err(HttpError::Transport(t.to_string()).into()),
    };

    Ok(response.into_json()?)
}
