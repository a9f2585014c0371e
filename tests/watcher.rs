//! Integration tests for container lifecycle tracking

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{wait_for, FakeRuntime, FlakyEmbedder, SlowEmbedder};
use docklens::core::SemanticIndex;
use docklens::ingest::{ContainerWatcher, StreamerConfig, WatcherHandle};
use docklens::runtime::{ContainerStatus, RuntimeEvent};
use docklens::Error;

fn setup() -> (Arc<FakeRuntime>, Arc<SemanticIndex>, ContainerWatcher) {
    let runtime = FakeRuntime::new();
    runtime.add("c1", "web", ContainerStatus::Running);
    runtime.add("c2", "old-job", ContainerStatus::Exited);
    let index = Arc::new(SemanticIndex::in_memory());
    let watcher = ContainerWatcher::new(
        runtime.clone(),
        FlakyEmbedder::new(),
        Arc::clone(&index),
        StreamerConfig::default(),
    );
    (runtime, index, watcher)
}

#[tokio::test]
async fn test_start_tracks_running_containers_only() {
    let (_runtime, _index, mut watcher) = setup();

    assert_eq!(watcher.start().await.unwrap(), 1);
    assert!(watcher.is_tracking("c1"));
    assert!(!watcher.is_tracking("c2"));
    assert!(watcher.monitor().is_running());

    watcher.stop().await;
    assert_eq!(watcher.active_count(), 0);
    assert!(!watcher.monitor().is_running());
}

#[tokio::test]
async fn test_duplicate_start_events_keep_one_streamer() {
    let (runtime, _index, mut watcher) = setup();
    watcher.start().await.unwrap();
    runtime.add("c3", "api", ContainerStatus::Running);

    watcher.handle_event(RuntimeEvent::container("start", "c3")).await;
    watcher.handle_event(RuntimeEvent::container("start", "c3")).await;
    watcher.handle_event(RuntimeEvent::container("start", "c1")).await;

    assert_eq!(watcher.active_count(), 2);
    let summary = watcher.monitor().get_watcher_stats().counters;
    assert_eq!(summary.events_received, 3);
    assert_eq!(summary.streamers_started, 2);

    watcher.stop().await;
}

#[tokio::test]
async fn test_start_event_for_stopped_or_unknown_container() {
    let (_runtime, _index, mut watcher) = setup();
    watcher.start().await.unwrap();

    assert!(!watcher.start_streamer("c2").await);
    assert!(!watcher.start_streamer("missing").await);
    assert_eq!(watcher.active_count(), 1);
    assert_eq!(
        watcher.monitor().get_watcher_stats().counters.start_errors,
        1
    );

    watcher.stop().await;
}

#[tokio::test]
async fn test_die_event_flushes_and_removes() {
    let (runtime, index, mut watcher) = setup();
    watcher.start().await.unwrap();

    assert!(wait_for(|| runtime.has_stream("c1")).await);
    runtime.push_line("c1", "ERROR out of memory");
    let monitor = watcher.monitor();
    assert!(
        wait_for(|| monitor
            .get_active_streamers()
            .get("c1")
            .is_some_and(|s| s.lines_processed == 1))
        .await
    );

    watcher.handle_event(RuntimeEvent::container("die", "c1")).await;
    assert!(!watcher.is_tracking("c1"));
    assert!(wait_for(|| index.len() == 1).await);
    assert_eq!(index.stats().per_container["c1"], 1);

    // Stopping twice is harmless
    assert!(!watcher.stop_streamer("c1"));
    watcher.stop().await;
    assert_eq!(watcher.stopping_count(), 0);
}

#[tokio::test]
async fn test_other_events_ignored() {
    let (_runtime, _index, mut watcher) = setup();
    watcher.start().await.unwrap();

    let mut network = RuntimeEvent::container("connect", "c1");
    network.kind = "network".into();
    watcher.handle_event(network).await;
    watcher.handle_event(RuntimeEvent::container("pause", "c1")).await;

    assert!(watcher.is_tracking("c1"));
    let summary = watcher.monitor().get_watcher_stats().counters;
    assert_eq!(summary.events_received, 2);
    assert_eq!(summary.events_ignored, 2);

    watcher.stop().await;
}

#[tokio::test]
async fn test_handle_reacts_to_events_and_self_heals() {
    let (runtime, _index, watcher) = setup();
    let handle = WatcherHandle::start(watcher).await.unwrap();
    let monitor = handle.monitor();
    assert_eq!(monitor.get_watcher_stats().active_count, 1);

    // Source of c1 ends on its own: its entry goes away
    assert!(wait_for(|| runtime.has_stream("c1")).await);
    runtime.end_logs("c1");
    assert!(wait_for(|| monitor.get_active_streamers().is_empty()).await);

    // A later start event brings it back with a fresh stream
    runtime.emit(Ok(RuntimeEvent::container("start", "c1")));
    assert!(wait_for(|| monitor.get_active_streamers().contains_key("c1")).await);
    assert!(wait_for(|| runtime.streams_opened() == 2).await);

    // Malformed records are skipped
    runtime.emit(Err(Error::EventFeed("truncated record".into())));
    assert!(wait_for(|| monitor.get_watcher_stats().counters.malformed_events == 1).await);
    assert!(!handle.is_finished());

    handle.stop().await.unwrap();
    assert!(!monitor.is_running());
    assert!(monitor.get_active_streamers().is_empty());
    assert!(!runtime.has_stream("c1"));
}

#[tokio::test]
async fn test_feed_end_stops_watcher() {
    let (runtime, _index, watcher) = setup();
    let handle = WatcherHandle::start(watcher).await.unwrap();
    assert!(wait_for(|| runtime.has_stream("c1")).await);

    runtime.end_events();
    assert!(wait_for(|| handle.is_finished()).await);
    assert!(matches!(handle.stop().await, Err(Error::EventFeed(_))));
    assert!(!runtime.has_stream("c1"));
}

#[tokio::test]
async fn test_unavailable_runtime_fails_start() {
    let (runtime, _index, watcher) = setup();
    runtime.unavailable.store(true, Ordering::SeqCst);

    let result = WatcherHandle::start(watcher).await;
    assert!(matches!(result, Err(Error::RuntimeUnavailable(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_final_flush_does_not_hold_up_events() {
    let delay = Duration::from_secs(2);
    let runtime = FakeRuntime::new();
    runtime.add("c1", "web", ContainerStatus::Running);
    let index = Arc::new(SemanticIndex::in_memory());
    let mut watcher = ContainerWatcher::new(
        runtime.clone(),
        SlowEmbedder::new(delay),
        Arc::clone(&index),
        StreamerConfig::default(),
    );
    watcher.start().await.unwrap();

    assert!(wait_for(|| runtime.has_stream("c1")).await);
    runtime.push_line("c1", "ERROR worker crashed");
    let monitor = watcher.monitor();
    assert!(
        wait_for(|| monitor
            .get_active_streamers()
            .get("c1")
            .is_some_and(|s| s.lines_processed == 1))
        .await
    );

    runtime.add("c3", "api", ContainerStatus::Running);
    let began = Instant::now();
    watcher.handle_event(RuntimeEvent::container("die", "c1")).await;
    watcher.handle_event(RuntimeEvent::container("start", "c3")).await;
    assert!(began.elapsed() < delay / 2);

    assert!(watcher.is_tracking("c3"));
    assert!(!watcher.is_tracking("c1"));
    assert_eq!(watcher.stopping_count(), 1);
    assert!(index.is_empty());

    // Stop waits for the background flush
    watcher.stop().await;
    assert_eq!(watcher.stopping_count(), 0);
    assert_eq!(index.stats().per_container["c1"], 1);
    assert_eq!(monitor.get_watcher_stats().counters.streamers_stopped, 2);
}
