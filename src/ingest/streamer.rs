//! Log Streamer - one container's buffer → chunk → embed → upsert loop
//!
//! A blocking worker drains the runtime's log source into a bounded channel.
//! The streamer task owns the buffer and selects over new lines, the
//! periodic chunk timer and its shutdown signal.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::chunker::{ChunkPolicy, LevelClassifier, TextSplitter};
use crate::core::{ChunkMetadata, ContainerSnapshot, LogChunk, SemanticIndex};
use crate::error::{Error, Result};
use crate::rag::Embedder;
use crate::runtime::{decode_line, ContainerRuntime};

// ============================================================================
// Configuration
// ============================================================================

/// Per-streamer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamerConfig {
    pub policy: ChunkPolicy,
    /// Lines buffered between the blocking reader and the streamer task
    pub line_channel_capacity: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            policy: ChunkPolicy::default(),
            line_channel_capacity: 1024,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters written by one streamer, readable from anywhere
#[derive(Debug)]
pub struct StreamerCounters {
    pub container_id: String,
    pub started_at: DateTime<Utc>,
    pub running: AtomicBool,
    pub lines_processed: AtomicUsize,
    pub chunks_created: AtomicUsize,
    pub embeddings_generated: AtomicUsize,
    pub processing_errors: AtomicUsize,
    pub buffered_lines: AtomicUsize,
}

impl StreamerCounters {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            started_at: Utc::now(),
            running: AtomicBool::new(false),
            lines_processed: AtomicUsize::new(0),
            chunks_created: AtomicUsize::new(0),
            embeddings_generated: AtomicUsize::new(0),
            processing_errors: AtomicUsize::new(0),
            buffered_lines: AtomicUsize::new(0),
        }
    }

    pub fn to_stats(&self) -> StreamerStats {
        StreamerStats {
            container_id: self.container_id.clone(),
            running: self.running.load(Ordering::Relaxed),
            started_at: self.started_at,
            lines_processed: self.lines_processed.load(Ordering::Relaxed),
            chunks_created: self.chunks_created.load(Ordering::Relaxed),
            embeddings_generated: self.embeddings_generated.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            buffered_lines: self.buffered_lines.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of streamer counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerStats {
    pub container_id: String,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub lines_processed: usize,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub processing_errors: usize,
    pub buffered_lines: usize,
}

// ============================================================================
// Log Streamer
// ============================================================================

/// What the blocking reader hands to the streamer task
#[derive(Debug)]
enum LineEvent {
    Line(String),
    Undecodable(String),
}

type Abort = Box<dyn FnOnce() + Send>;

/// Ingests one container's logs.
///
/// Owns its buffer exclusively; only counters are shared.
pub struct LogStreamer {
    container_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    embedder: Arc<dyn Embedder>,
    index: Arc<SemanticIndex>,
    config: StreamerConfig,
    splitter: TextSplitter,
    classifier: LevelClassifier,
    buffer: Vec<String>,
    buffered_chars: usize,
    last_flush: Instant,
    sequence: u64,
    running: bool,
    counters: Arc<StreamerCounters>,
    // Mutex keeps the streamer Sync while the hook itself is only Send
    abort_source: Option<Mutex<Abort>>,
}

impl LogStreamer {
    pub fn new(
        container_id: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        embedder: Arc<dyn Embedder>,
        index: Arc<SemanticIndex>,
        config: StreamerConfig,
    ) -> Self {
        let container_id = container_id.into();
        Self {
            counters: Arc::new(StreamerCounters::new(container_id.clone())),
            splitter: config.policy.splitter(),
            classifier: LevelClassifier::default(),
            container_id,
            runtime,
            embedder,
            index,
            config,
            buffer: Vec::new(),
            buffered_chars: 0,
            last_flush: Instant::now(),
            sequence: 0,
            running: false,
            abort_source: None,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn counters(&self) -> Arc<StreamerCounters> {
        Arc::clone(&self.counters)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn buffered_lines(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_chars(&self) -> usize {
        self.buffered_chars
    }

    /// Current counters, no side effects
    pub fn get_stats(&self) -> StreamerStats {
        self.counters.to_stats()
    }

    /// Follow the container's logs until `shutdown` fires or the source ends.
    ///
    /// Always finishes with `stop_streaming`, so buffered lines are flushed.
    pub async fn start_streaming(&mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        self.running = true;
        self.counters.running.store(true, Ordering::Relaxed);
        self.last_flush = Instant::now();

        let runtime = Arc::clone(&self.runtime);
        let id = self.container_id.clone();
        let stream = match tokio::task::spawn_blocking(move || runtime.stream_logs(&id)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.mark_stopped();
                return Err(e);
            }
            Err(e) => {
                self.mark_stopped();
                return Err(e.into());
            }
        };

        let (lines, abort) = stream.into_parts();
        self.abort_source = abort.map(Mutex::new);

        info!(container_id = %self.container_id, "Log streaming started");

        let (tx, mut rx) = mpsc::channel(self.config.line_channel_capacity.max(1));
        let reader_id = self.container_id.clone();
        tokio::task::spawn_blocking(move || {
            for raw in lines {
                let event = match raw {
                    Ok(bytes) => match decode_line(&reader_id, bytes) {
                        Ok(line) => LineEvent::Line(line),
                        Err(e) => LineEvent::Undecodable(e.to_string()),
                    },
                    Err(e) => {
                        warn!(container_id = %reader_id, error = %e, "Log source read failed");
                        break;
                    }
                };
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            debug!(container_id = %reader_id, "Log reader finished");
        });

        let mut ticker = tokio::time::interval(self.config.policy.timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!(container_id = %self.container_id, "Shutdown requested");
                    break;
                }
                event = rx.recv() => match event {
                    Some(LineEvent::Line(line)) => self.process_line(line).await,
                    Some(LineEvent::Undecodable(reason)) => {
                        self.counters.processing_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(container_id = %self.container_id, %reason, "Dropped undecodable log line");
                    }
                    None => {
                        info!(container_id = %self.container_id, "Log source ended");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if self.should_chunk() {
                        self.flush().await;
                    }
                }
            }
        }

        // Unblock the reader, then keep whatever it already queued
        self.abort();
        rx.close();
        while let Some(event) = rx.recv().await {
            match event {
                LineEvent::Line(line) => self.push_line(line),
                LineEvent::Undecodable(_) => {
                    self.counters.processing_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.stop_streaming().await?;
        Ok(())
    }

    /// Append one decoded line and flush if a threshold is crossed
    pub async fn process_line(&mut self, line: String) {
        self.push_line(line);
        if self.should_chunk() {
            self.flush().await;
        }
    }

    fn push_line(&mut self, line: String) {
        self.buffered_chars += line.chars().count();
        self.buffer.push(line);
        self.counters.lines_processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .buffered_lines
            .store(self.buffer.len(), Ordering::Relaxed);
    }

    /// Size, line count or timeout threshold reached
    pub fn should_chunk(&self) -> bool {
        self.config.policy.should_chunk(
            self.buffered_chars,
            self.buffer.len(),
            self.last_flush.elapsed(),
        )
    }

    /// `chunk_and_store` with failures absorbed: the buffer stays for the next trigger
    async fn flush(&mut self) {
        if let Err(e) = self.chunk_and_store().await {
            self.counters.processing_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                container_id = %self.container_id,
                buffered_lines = self.buffer.len(),
                error = %e,
                "Flush failed, keeping buffer for retry"
            );
        }
    }

    /// Split the buffer into chunks, embed them in one call and upsert them.
    ///
    /// The buffer is cleared only after the upsert succeeds. Returns the
    /// number of chunks stored.
    pub async fn chunk_and_store(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let full_text = self.buffer.join("\n");
        let pieces = self.splitter.split(&full_text);
        let snapshot = Self::snapshot(Arc::clone(&self.runtime), self.container_id.clone()).await;
        let timestamp = Utc::now();
        let total_chunks = pieces.len();

        let chunks: Vec<LogChunk> = pieces
            .into_iter()
            .enumerate()
            .map(|(i, text)| self.build_chunk(text, i, total_chunks, timestamp, &snapshot))
            .collect();

        let embedder = Arc::clone(&self.embedder);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            embedder.embed_batch(&refs)
        })
        .await?
        .map_err(|e| Error::collaborator("embedding", e))?;

        if vectors.len() != chunks.len() {
            return Err(Error::Collaborator {
                service: "embedding",
                message: format!("{} vectors for {} chunks", vectors.len(), chunks.len()),
            });
        }
        let embedded = vectors.len();

        let index = Arc::clone(&self.index);
        let stored = tokio::task::spawn_blocking(move || index.upsert(&chunks, &vectors)).await??;

        debug!(
            container_id = %self.container_id,
            chunks = stored,
            lines = self.buffer.len(),
            "Stored chunks"
        );

        self.sequence += stored as u64;
        self.buffer.clear();
        self.buffered_chars = 0;
        self.last_flush = Instant::now();
        self.counters.buffered_lines.store(0, Ordering::Relaxed);
        self.counters.chunks_created.fetch_add(stored, Ordering::Relaxed);
        self.counters
            .embeddings_generated
            .fetch_add(embedded, Ordering::Relaxed);

        Ok(stored)
    }

    /// Stop ingesting and flush whatever is buffered, exactly once.
    ///
    /// Returns the number of chunks the final flush stored.
    pub async fn stop_streaming(&mut self) -> Result<usize> {
        self.running = false;
        self.counters.running.store(false, Ordering::Relaxed);
        self.abort();

        let stored = if self.buffer.is_empty() {
            0
        } else {
            match self.chunk_and_store().await {
                Ok(n) => n,
                // Last chance for these lines; they go with the streamer
                Err(e) => {
                    self.counters.processing_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        container_id = %self.container_id,
                        lost_lines = self.buffer.len(),
                        error = %e,
                        "Final flush failed"
                    );
                    return Err(e);
                }
            }
        };

        self.log_summary();
        Ok(stored)
    }

    fn abort(&mut self) {
        if let Some(abort) = self.abort_source.take() {
            (abort.into_inner())();
        }
    }

    fn mark_stopped(&mut self) {
        self.running = false;
        self.counters.running.store(false, Ordering::Relaxed);
    }

    /// Container state at flush time; placeholder when the runtime can't say
    async fn snapshot(runtime: Arc<dyn ContainerRuntime>, container_id: String) -> ContainerSnapshot {
        let id = container_id.clone();
        match tokio::task::spawn_blocking(move || runtime.get_container(&id)).await {
            Ok(Ok(container)) => ContainerSnapshot::from(&container),
            Ok(Err(e)) => {
                warn!(%container_id, error = %e, "Container metadata unavailable");
                ContainerSnapshot::unknown()
            }
            Err(e) => {
                warn!(%container_id, error = %e, "Container metadata task failed");
                ContainerSnapshot::unknown()
            }
        }
    }

    fn build_chunk(
        &self,
        text: String,
        chunk_index: usize,
        total_chunks: usize,
        timestamp: DateTime<Utc>,
        snapshot: &ContainerSnapshot,
    ) -> LogChunk {
        let class = self.classifier.classify(&text);

        let mut extra = BTreeMap::new();
        extra.insert("chunk_method".to_string(), "boundary_splitter".to_string());
        extra.insert(
            "original_line_count".to_string(),
            self.buffer.len().to_string(),
        );

        LogChunk {
            id: LogChunk::new_id(&self.container_id),
            metadata: ChunkMetadata {
                container_id: self.container_id.clone(),
                timestamp,
                sequence: self.sequence + chunk_index as u64,
                chunk_index,
                total_chunks,
                line_count: text.matches('\n').count() + 1,
                char_count: text.chars().count(),
                log_level: class.level,
                severity_score: class.level.severity(),
                has_error: class.error_count > 0,
                has_warning: class.warning_count > 0,
                error_count: class.error_count,
                warning_count: class.warning_count,
                container: snapshot.clone(),
                extra,
            },
            text,
        }
    }

    fn log_summary(&self) {
        let stats = self.counters.to_stats();
        let duration = (Utc::now() - stats.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let secs = duration.as_secs_f64();
        let lines_per_sec = if secs > 0.0 {
            (stats.lines_processed as f64 / secs * 10.0).round() / 10.0
        } else {
            0.0
        };

        info!(
            container_id = %self.container_id,
            duration = %humantime::format_duration(Duration::from_secs(duration.as_secs())),
            lines = stats.lines_processed,
            chunks = stats.chunks_created,
            embeddings = stats.embeddings_generated,
            errors = stats.processing_errors,
            lines_per_sec,
            "Log streaming finished"
        );
    }
}

// ============================================================================
// Streamer Handle
// ============================================================================

/// Sent when a streamer task ends for any reason
#[derive(Debug, Clone)]
pub struct StreamerExit {
    pub container_id: String,
    pub generation: u64,
    pub error: Option<String>,
}

/// A running streamer task
pub struct StreamerHandle {
    container_id: String,
    generation: u64,
    counters: Arc<StreamerCounters>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl StreamerHandle {
    /// Spawn `streamer` on the current runtime.
    ///
    /// `exited`, if given, is notified when the task finishes on its own or
    /// after a stop.
    pub fn spawn(
        mut streamer: LogStreamer,
        generation: u64,
        exited: Option<mpsc::UnboundedSender<StreamerExit>>,
    ) -> Self {
        let container_id = streamer.container_id().to_string();
        let counters = streamer.counters();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task_id = container_id.clone();
        let task = tokio::spawn(async move {
            let result = streamer.start_streaming(shutdown_rx).await;
            if let Err(e) = &result {
                warn!(container_id = %task_id, error = %e, "Streamer exited with error");
            }
            if let Some(exited) = exited {
                // Watcher gone means nobody is tracking us
                let _ = exited.send(StreamerExit {
                    container_id: task_id,
                    generation,
                    error: result.as_ref().err().map(ToString::to_string),
                });
            }
            result
        });

        Self {
            container_id,
            generation,
            counters,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn counters(&self) -> Arc<StreamerCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> StreamerStats {
        self.counters.to_stats()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait for the final flush
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            // Already-exited tasks dropped their receiver
            let _ = tx.send(());
        }
        self.task.await?
    }
}
