//! Error types for docklens.

use thiserror::Error;

use crate::core::IndexError;

/// Errors surfaced by ingestion, retrieval and the runtime adapters.
#[derive(Debug, Error)]
pub enum Error {
    /// A single log line could not be decoded.
    #[error("undecodable log line from {container_id}: {reason}")]
    Decode {
        /// Container the line came from.
        container_id: String,
        /// Decoder message.
        reason: String,
    },

    /// The container runtime could not be reached.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Unknown container id.
    #[error("container not found: {0}")]
    NotFound(String),

    /// An embedding, rerank or completion call failed.
    #[error("{service} call failed: {message}")]
    Collaborator {
        /// Which collaborator failed ("embedding", "rerank", "completion").
        service: &'static str,
        /// Rendered error chain.
        message: String,
    },

    /// Malformed or transient lifecycle event.
    #[error("event feed error: {0}")]
    EventFeed(String),

    /// Semantic index failure.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A worker task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a collaborator failure, keeping the whole context chain.
    pub fn collaborator(service: &'static str, err: anyhow::Error) -> Self {
        Error::Collaborator {
            service,
            message: format!("{err:#}"),
        }
    }

    /// True for faults the ingestion path absorbs and retries on the next flush.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Collaborator { .. } | Error::Index(_) | Error::Task(_))
    }

    /// Text safe to show an end user. Never includes internals.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "The requested container is unknown.",
            Error::RuntimeUnavailable(_) => "The container runtime is not reachable right now.",
            Error::Collaborator { .. } | Error::Index(_) => {
                "Failed to process the query. Please try again later."
            }
            _ => "An internal error occurred while processing the request.",
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
