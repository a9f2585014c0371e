//! DockLens Library
//!
//! Follows the logs of running containers, cuts them into classified
//! chunks, embeds and indexes them, and answers natural-language
//! questions about one container's logs with a two-stage retriever and a
//! completion model.
//!
//! # Features
//!
//! - **Live Ingestion**: One streamer per running container, started and
//!   stopped from the runtime's lifecycle events
//! - **Boundary-Aware Chunking**: Paragraph, line, then sentence breaks,
//!   with overlap between neighbouring chunks
//! - **Level Classification**: error / warn / info / debug per chunk
//! - **Two-Stage Retrieval**: Cosine recall, then an optional rerank that
//!   falls back to similarity order on failure
//! - **Persistent Index**: bincode snapshot rewritten on every change
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docklens::core::SemanticIndex;
//! use docklens::ingest::{ContainerWatcher, StreamerConfig, WatcherHandle};
//! use docklens::rag::HashEmbedder;
//! use docklens::runtime::DockerCli;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let index = Arc::new(SemanticIndex::open("logs.idx")?);
//!     let watcher = ContainerWatcher::new(
//!         Arc::new(DockerCli::new("docker")),
//!         Arc::new(HashEmbedder::new(384)),
//!         index,
//!         StreamerConfig::default(),
//!     );
//!
//!     let handle = WatcherHandle::start(watcher).await?;
//!     tokio::signal::ctrl_c().await?;
//!     handle.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod ingest;
pub mod rag;
pub mod retry;
pub mod runtime;
pub mod service;

// Re-export commonly used types
pub use config::Config;
pub use core::{ChunkMetadata, ContainerSnapshot, LogChunk, LogLevel, SemanticIndex};
pub use error::{Error, Result};
pub use ingest::{ContainerWatcher, LogStreamer, WatcherHandle, WatcherMonitor};
pub use rag::{Completer, Embedder, Reranker, Retriever};
pub use retry::{with_retry, RetryPolicy};
pub use runtime::{Container, ContainerRuntime, DockerCli};
pub use service::{DockLens, QueryOptions, QueryResponse};
