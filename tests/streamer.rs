//! Integration tests for per-container log streaming

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{settle, wait_for, FakeRuntime, FlakyEmbedder};
use docklens::core::{LogLevel, QueryFilter, SemanticIndex};
use docklens::ingest::{LogStreamer, StreamerConfig, StreamerHandle};
use docklens::rag::Embedder;
use docklens::runtime::ContainerStatus;

fn streamer(runtime: &Arc<FakeRuntime>, embedder: &Arc<FlakyEmbedder>, index: &Arc<SemanticIndex>) -> LogStreamer {
    LogStreamer::new(
        "c1",
        runtime.clone(),
        embedder.clone(),
        Arc::clone(index),
        StreamerConfig::default(),
    )
}

fn setup() -> (Arc<FakeRuntime>, Arc<FlakyEmbedder>, Arc<SemanticIndex>) {
    let runtime = FakeRuntime::new();
    runtime.add("c1", "web", ContainerStatus::Running);
    (runtime, FlakyEmbedder::new(), Arc::new(SemanticIndex::in_memory()))
}

#[tokio::test]
async fn test_stop_flushes_small_buffer_once() {
    let (runtime, embedder, index) = setup();
    let mut s = streamer(&runtime, &embedder, &index);

    for line in ["server listening on :80", "GET /health 200", "GET /ready 200"] {
        s.process_line(line.to_string()).await;
    }
    assert_eq!(s.buffered_lines(), 3);
    assert!(index.is_empty());

    assert_eq!(s.stop_streaming().await.unwrap(), 1);
    assert_eq!(index.len(), 1);
    assert_eq!(s.buffered_lines(), 0);

    // Nothing left to flush
    assert_eq!(s.stop_streaming().await.unwrap(), 0);
    assert_eq!(index.len(), 1);
    assert_eq!(embedder.batch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_line_threshold_triggers_flush() {
    let (runtime, embedder, index) = setup();
    let mut s = streamer(&runtime, &embedder, &index);

    for i in 0..24 {
        s.process_line(format!("tick {i}")).await;
    }
    assert!(index.is_empty());
    assert_eq!(s.buffered_lines(), 24);

    s.process_line("tick 24".to_string()).await;
    assert_eq!(s.buffered_lines(), 0);
    assert_eq!(index.len(), 1);

    let stats = s.get_stats();
    assert_eq!(stats.lines_processed, 25);
    assert_eq!(stats.chunks_created, 1);
    assert_eq!(stats.embeddings_generated, 1);
}

#[tokio::test]
async fn test_size_threshold_splits_into_overlapping_chunks() {
    let (runtime, embedder, index) = setup();
    let mut s = streamer(&runtime, &embedder, &index);

    // Two long lines cross the 1500-char threshold on the second append
    let line = "worker processed batch with payload ".repeat(25);
    s.process_line(line.clone()).await;
    assert!(index.is_empty());
    s.process_line(line).await;

    assert_eq!(s.buffered_lines(), 0);
    assert!(index.len() >= 2);
    let stats = index.stats();
    assert_eq!(stats.per_container["c1"], index.len());
}

#[tokio::test]
async fn test_failed_embedding_keeps_buffer() {
    let (runtime, embedder, index) = setup();
    let mut s = streamer(&runtime, &embedder, &index);

    for line in ["a", "b", "c"] {
        s.process_line(line.to_string()).await;
    }

    embedder.set_failing(true);
    assert!(s.chunk_and_store().await.is_err());
    assert_eq!(s.buffered_lines(), 3);
    assert!(index.is_empty());

    embedder.set_failing(false);
    assert_eq!(s.chunk_and_store().await.unwrap(), 1);
    assert_eq!(s.buffered_lines(), 0);
    assert_eq!(index.len(), 1);
}

#[tokio::test]
async fn test_failed_final_flush_is_reported() {
    let (runtime, embedder, index) = setup();
    let mut s = streamer(&runtime, &embedder, &index);
    s.process_line("last words".to_string()).await;

    embedder.set_failing(true);
    assert!(s.stop_streaming().await.is_err());
    assert!(index.is_empty());
    assert_eq!(s.get_stats().processing_errors, 1);
}

#[tokio::test]
async fn test_chunk_metadata() {
    let (runtime, embedder, index) = setup();
    let mut s = streamer(&runtime, &embedder, &index);

    s.process_line("2024-05-01T10:00:00Z starting".to_string()).await;
    s.process_line("2024-05-01T10:00:01Z ERROR connection refused".to_string()).await;
    s.stop_streaming().await.unwrap();

    let query = embedder.embed("connection refused").unwrap();
    let hits = index
        .query_similar(&query, &QueryFilter::container("c1"), 5)
        .unwrap();
    assert_eq!(hits.len(), 1);

    let meta = &hits[0].metadata;
    assert_eq!(meta.log_level, LogLevel::Error);
    assert!(meta.has_error);
    assert_eq!(meta.error_count, 1);
    assert_eq!(meta.severity_score, 1.0);
    assert_eq!(meta.line_count, 2);
    assert_eq!(meta.chunk_index, 0);
    assert_eq!(meta.total_chunks, 1);
    assert_eq!(meta.container.name, "web");
    assert_eq!(meta.container.image, "nginx:latest");
    assert_eq!(meta.container.env_keys, vec!["SECRET", "PORT"]);
    assert_eq!(meta.extra["chunk_method"], "boundary_splitter");
    assert_eq!(meta.extra["original_line_count"], "2");
    assert!(hits[0].id.starts_with("c1_"));
}

#[tokio::test]
async fn test_unknown_container_gets_placeholder_metadata() {
    let (runtime, embedder, index) = setup();
    let mut s = LogStreamer::new(
        "ghost",
        runtime.clone(),
        embedder.clone(),
        Arc::clone(&index),
        StreamerConfig::default(),
    );
    s.process_line("hello".to_string()).await;
    s.stop_streaming().await.unwrap();

    let query = embedder.embed("hello").unwrap();
    let hits = index
        .query_similar(&query, &QueryFilter::container("ghost"), 1)
        .unwrap();
    assert_eq!(hits[0].metadata.container.name, "unknown");
}

#[tokio::test]
async fn test_stream_until_source_ends() {
    let (runtime, embedder, index) = setup();
    let handle = StreamerHandle::spawn(streamer(&runtime, &embedder, &index), 1, None);

    assert!(wait_for(|| runtime.has_stream("c1")).await);
    assert!(runtime.push_line("c1", "booting"));
    assert!(runtime.push_bytes("c1", vec![0xff, 0xfe, 0x00]));
    assert!(runtime.push_line("c1", "ready\r"));
    runtime.end_logs("c1");

    assert!(wait_for(|| handle.is_finished()).await);
    let stats = handle.stats();
    handle.stop().await.unwrap();

    assert_eq!(stats.lines_processed, 2);
    assert_eq!(stats.processing_errors, 1);
    assert!(!stats.running);
    assert_eq!(index.len(), 1);

    let query = embedder.embed("booting").unwrap();
    let hits = index
        .query_similar(&query, &QueryFilter::container("c1"), 1)
        .unwrap();
    assert_eq!(hits[0].text, "booting\nready");
}

#[tokio::test]
async fn test_stop_handle_flushes_and_releases_source() {
    let (runtime, embedder, index) = setup();
    let handle = StreamerHandle::spawn(streamer(&runtime, &embedder, &index), 7, None);
    assert_eq!(handle.generation(), 7);

    assert!(wait_for(|| runtime.has_stream("c1")).await);
    runtime.push_line("c1", "one");
    runtime.push_line("c1", "two");
    let counters = handle.counters();
    assert!(wait_for(|| counters.lines_processed.load(Ordering::Relaxed) == 2).await);
    assert!(counters.running.load(Ordering::Relaxed));

    handle.stop().await.unwrap();
    assert!(!runtime.has_stream("c1"));
    assert_eq!(index.len(), 1);
    assert!(!counters.running.load(Ordering::Relaxed));
}

#[tokio::test]
async fn test_refused_stream_reports_error() {
    let (runtime, embedder, index) = setup();
    runtime.fail_logs.store(true, Ordering::SeqCst);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = StreamerHandle::spawn(streamer(&runtime, &embedder, &index), 3, Some(tx));

    let exit = rx.recv().await.unwrap();
    assert_eq!(exit.container_id, "c1");
    assert_eq!(exit.generation, 3);
    assert!(exit.error.is_some());
    assert!(handle.stop().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_quiet_buffer_above_floor() {
    let (runtime, embedder, index) = setup();
    let handle = StreamerHandle::spawn(streamer(&runtime, &embedder, &index), 1, None);
    assert!(settle(|| runtime.has_stream("c1")).await);

    // 250 chars over 2 lines: below the size and line thresholds
    runtime.push_line("c1", &"a".repeat(125));
    runtime.push_line("c1", &"b".repeat(125));
    let counters = handle.counters();
    assert!(settle(|| counters.lines_processed.load(Ordering::Relaxed) == 2).await);
    assert!(index.is_empty());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(settle(|| index.len() == 1).await);
    assert_eq!(counters.buffered_lines.load(Ordering::Relaxed), 0);

    handle.stop().await.unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(embedder.batch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timer_leaves_buffer_below_floor() {
    let (runtime, embedder, index) = setup();
    let handle = StreamerHandle::spawn(streamer(&runtime, &embedder, &index), 1, None);
    assert!(settle(|| runtime.has_stream("c1")).await);

    runtime.push_line("c1", &"a".repeat(25));
    runtime.push_line("c1", &"b".repeat(25));
    let counters = handle.counters();
    assert!(settle(|| counters.lines_processed.load(Ordering::Relaxed) == 2).await);

    tokio::time::advance(Duration::from_secs(31)).await;
    for _ in 0..10 {
        std::thread::sleep(Duration::from_millis(10));
        tokio::task::yield_now().await;
    }
    assert!(index.is_empty());
    assert_eq!(counters.buffered_lines.load(Ordering::Relaxed), 2);
    assert_eq!(embedder.batch_calls.load(Ordering::SeqCst), 0);

    // Still flushed on stop
    handle.stop().await.unwrap();
    assert_eq!(index.len(), 1);
}
