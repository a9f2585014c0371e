//! Ingestion - log streaming, chunking and container lifecycle tracking

pub mod chunker;
pub mod streamer;
pub mod watcher;

pub use chunker::{ChunkPolicy, Classification, LevelClassifier, TextSplitter};
pub use streamer::{LogStreamer, StreamerConfig, StreamerCounters, StreamerExit, StreamerHandle, StreamerStats};
pub use watcher::{
    ContainerWatcher, WatcherCounters, WatcherHandle, WatcherMonitor, WatcherStats, WatcherSummary,
};
