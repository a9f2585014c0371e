//! Lifecycle Watcher - one streamer per running container
//!
//! The watcher task is the only writer of the container → streamer map.
//! Events arrive from a blocking worker over a channel; streamer exits
//! arrive on a second channel so dead entries are dropped and a later
//! `start` event can recreate them. Stopping streamers flush on a join set
//! so a slow final flush never holds up the next event.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::streamer::{
    LogStreamer, StreamerConfig, StreamerCounters, StreamerExit, StreamerHandle, StreamerStats,
};
use crate::core::SemanticIndex;
use crate::error::{Error, Result};
use crate::rag::Embedder;
use crate::runtime::{ContainerRuntime, RuntimeEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Watcher Statistics
// ============================================================================

/// Counters tracked by the watcher
#[derive(Debug, Default)]
pub struct WatcherCounters {
    pub events_received: AtomicUsize,
    pub events_ignored: AtomicUsize,
    pub malformed_events: AtomicUsize,
    pub streamers_started: AtomicUsize,
    pub streamers_stopped: AtomicUsize,
    pub streamer_failures: AtomicUsize,
    pub start_errors: AtomicUsize,
}

impl WatcherCounters {
    pub fn to_summary(&self) -> WatcherSummary {
        WatcherSummary {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
            streamers_started: self.streamers_started.load(Ordering::Relaxed),
            streamers_stopped: self.streamers_stopped.load(Ordering::Relaxed),
            streamer_failures: self.streamer_failures.load(Ordering::Relaxed),
            start_errors: self.start_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serializable summary of watcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherSummary {
    pub events_received: usize,
    pub events_ignored: usize,
    pub malformed_events: usize,
    pub streamers_started: usize,
    pub streamers_stopped: usize,
    pub streamer_failures: usize,
    pub start_errors: usize,
}

/// `get_watcher_stats` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStats {
    pub running: bool,
    pub active_count: usize,
    pub runtime_seconds: f64,
    pub counters: WatcherSummary,
}

#[derive(Debug, Default)]
struct MonitorInner {
    running: AtomicBool,
    started_at: RwLock<Option<Instant>>,
    streamers: RwLock<HashMap<String, Arc<StreamerCounters>>>,
    counters: WatcherCounters,
}

/// Read-only view of a watcher, safe to clone into other tasks.
///
/// Reads may lag in-flight starts and stops.
#[derive(Debug, Clone, Default)]
pub struct WatcherMonitor {
    inner: Arc<MonitorInner>,
}

impl WatcherMonitor {
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    pub fn get_active_streamers(&self) -> BTreeMap<String, StreamerStats> {
        self.inner
            .streamers
            .read()
            .iter()
            .map(|(id, counters)| (id.clone(), counters.to_stats()))
            .collect()
    }

    pub fn get_watcher_stats(&self) -> WatcherStats {
        let started_at = *self.inner.started_at.read();
        let runtime_seconds = started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        WatcherStats {
            running: self.is_running(),
            active_count: self.inner.streamers.read().len(),
            runtime_seconds,
            counters: self.inner.counters.to_summary(),
        }
    }

    fn counters(&self) -> &WatcherCounters {
        &self.inner.counters
    }

    fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::Relaxed);
        let mut started = self.inner.started_at.write();
        *started = running.then(Instant::now);
    }

    fn register(&self, id: &str, counters: Arc<StreamerCounters>) {
        self.inner.streamers.write().insert(id.to_string(), counters);
    }

    fn unregister(&self, id: &str) {
        self.inner.streamers.write().remove(id);
    }
}

// ============================================================================
// Container Watcher
// ============================================================================

type Abort = Box<dyn FnOnce() + Send>;

/// Tracks running containers and keeps one streamer per container
pub struct ContainerWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    embedder: Arc<dyn Embedder>,
    index: Arc<SemanticIndex>,
    config: StreamerConfig,
    streamers: HashMap<String, StreamerHandle>,
    monitor: WatcherMonitor,
    next_generation: u64,
    exit_tx: mpsc::UnboundedSender<StreamerExit>,
    exit_rx: Option<mpsc::UnboundedReceiver<StreamerExit>>,
    event_rx: Option<mpsc::Receiver<Result<RuntimeEvent>>>,
    abort_feed: Option<Abort>,
    stopping: JoinSet<(String, Result<()>)>,
}

impl ContainerWatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        embedder: Arc<dyn Embedder>,
        index: Arc<SemanticIndex>,
        config: StreamerConfig,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            embedder,
            index,
            config,
            streamers: HashMap::new(),
            monitor: WatcherMonitor::default(),
            next_generation: 0,
            exit_tx,
            exit_rx: Some(exit_rx),
            event_rx: None,
            abort_feed: None,
            stopping: JoinSet::new(),
        }
    }

    pub fn monitor(&self) -> WatcherMonitor {
        self.monitor.clone()
    }

    pub fn is_tracking(&self, container_id: &str) -> bool {
        self.streamers.contains_key(container_id)
    }

    pub fn active_count(&self) -> usize {
        self.streamers.len()
    }

    /// Start a streamer for every running container, then subscribe to events.
    ///
    /// Runtime failures are surfaced. Returns the number of streamers started.
    pub async fn start(&mut self) -> Result<usize> {
        let runtime = Arc::clone(&self.runtime);
        let containers = tokio::task::spawn_blocking(move || runtime.list_containers(false)).await??;

        info!(
            runtime = self.runtime.name(),
            running = containers.len(),
            "Starting container watcher"
        );

        let mut started = 0;
        for container in containers.iter().filter(|c| c.is_running()) {
            if self.spawn_streamer(&container.id) {
                started += 1;
            }
        }

        let runtime = Arc::clone(&self.runtime);
        let feed = tokio::task::spawn_blocking(move || runtime.events()).await??;
        let (events, abort) = feed.into_parts();
        self.abort_feed = abort;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            for event in events {
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            debug!("Event feed worker finished");
        });
        self.event_rx = Some(rx);

        self.monitor.set_running(true);
        Ok(started)
    }

    /// Dispatch events until `shutdown` fires or the feed ends.
    ///
    /// Does not stop streamers; call `stop` afterwards.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let mut events = self
            .event_rx
            .take()
            .ok_or_else(|| Error::EventFeed("watcher not started".to_string()))?;
        let mut exits = match self.exit_rx.take() {
            Some(rx) => rx,
            None => return Err(Error::EventFeed("watcher already running".to_string())),
        };

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                event = events.recv() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => {
                        self.monitor.counters().malformed_events.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Skipping bad lifecycle event");
                    }
                    None => {
                        warn!("Lifecycle event feed ended");
                        break Err(Error::EventFeed("event feed ended".to_string()));
                    }
                },
                Some(exit) = exits.recv() => self.handle_exit(exit),
                Some(joined) = self.stopping.join_next() => finish_stop(joined),
            }
        };

        self.exit_rx = Some(exits);
        result
    }

    /// Apply one lifecycle event
    pub async fn handle_event(&mut self, event: RuntimeEvent) {
        let monitor = self.monitor.clone();
        let counters = monitor.counters();
        counters.events_received.fetch_add(1, Ordering::Relaxed);

        if event.kind != "container" {
            counters.events_ignored.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %event.kind, action = %event.action, "Ignoring non-container event");
            return;
        }

        match event.action.as_str() {
            "start" => {
                self.start_streamer(&event.actor_id).await;
            }
            "stop" | "die" => {
                self.stop_streamer(&event.actor_id);
            }
            other => {
                counters.events_ignored.fetch_add(1, Ordering::Relaxed);
                debug!(container_id = %event.actor_id, action = other, "Ignoring container event");
            }
        }
    }

    /// Start streaming `container_id` unless already tracked or not running
    pub async fn start_streamer(&mut self, container_id: &str) -> bool {
        if self.streamers.contains_key(container_id) {
            debug!(container_id, "Streamer already active");
            return false;
        }

        let runtime = Arc::clone(&self.runtime);
        let id = container_id.to_string();
        let container = match tokio::task::spawn_blocking(move || runtime.get_container(&id)).await {
            Ok(Ok(container)) => container,
            Ok(Err(e)) => {
                self.monitor.counters().start_errors.fetch_add(1, Ordering::Relaxed);
                warn!(container_id, error = %e, "Cannot start streamer");
                return false;
            }
            Err(e) => {
                self.monitor.counters().start_errors.fetch_add(1, Ordering::Relaxed);
                warn!(container_id, error = %e, "Container lookup task failed");
                return false;
            }
        };

        if !container.is_running() {
            debug!(container_id, status = %container.status, "Container not running, skipping");
            return false;
        }

        self.spawn_streamer(container_id)
    }

    fn spawn_streamer(&mut self, container_id: &str) -> bool {
        if self.streamers.contains_key(container_id) {
            return false;
        }

        let streamer = LogStreamer::new(
            container_id,
            Arc::clone(&self.runtime),
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.config.clone(),
        );

        self.next_generation += 1;
        let handle = StreamerHandle::spawn(streamer, self.next_generation, Some(self.exit_tx.clone()));

        self.monitor.register(container_id, handle.counters());
        self.streamers.insert(container_id.to_string(), handle);
        self.monitor
            .counters()
            .streamers_started
            .fetch_add(1, Ordering::Relaxed);

        info!(container_id, "Streamer started");
        true
    }

    /// Forget the streamer for `container_id` and let it flush in the background.
    ///
    /// The entry is gone on return; the final flush finishes on the stopping
    /// set, which `stop` drains.
    pub fn stop_streamer(&mut self, container_id: &str) -> bool {
        let Some(handle) = self.detach(container_id) else {
            debug!(container_id, "No active streamer to stop");
            return false;
        };

        let id = container_id.to_string();
        self.stopping.spawn(async move {
            let result = handle.stop().await;
            (id, result)
        });
        debug!(container_id, in_flight = self.stopping.len(), "Streamer stopping");
        true
    }

    /// Number of streamers still running their final flush
    pub fn stopping_count(&self) -> usize {
        self.stopping.len()
    }

    fn detach(&mut self, container_id: &str) -> Option<StreamerHandle> {
        let handle = self.streamers.remove(container_id)?;
        self.monitor.unregister(container_id);
        self.monitor
            .counters()
            .streamers_stopped
            .fetch_add(1, Ordering::Relaxed);
        Some(handle)
    }

    fn handle_exit(&mut self, exit: StreamerExit) {
        let current = self
            .streamers
            .get(&exit.container_id)
            .map(StreamerHandle::generation);

        // A newer streamer may already own this id
        if current != Some(exit.generation) {
            return;
        }

        self.streamers.remove(&exit.container_id);
        self.monitor.unregister(&exit.container_id);

        match exit.error {
            Some(error) => {
                self.monitor
                    .counters()
                    .streamer_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(container_id = %exit.container_id, %error, "Streamer failed, entry removed");
            }
            None => {
                info!(container_id = %exit.container_id, "Streamer finished, entry removed");
            }
        }
    }

    /// Cancel the event feed, then stop every streamer one at a time
    pub async fn stop(&mut self) {
        if let Some(abort) = self.abort_feed.take() {
            abort();
        }
        self.event_rx = None;

        let mut ids: Vec<String> = self.streamers.keys().cloned().collect();
        ids.sort();
        info!(streamers = ids.len(), "Stopping container watcher");

        for id in ids {
            if let Some(handle) = self.detach(&id) {
                finish_stop(Ok((id, handle.stop().await)));
            }
        }

        while let Some(joined) = self.stopping.join_next().await {
            finish_stop(joined);
        }

        self.monitor.set_running(false);
        info!("Container watcher stopped");
    }
}

fn finish_stop(joined: std::result::Result<(String, Result<()>), JoinError>) {
    match joined {
        Ok((container_id, Ok(()))) => info!(%container_id, "Streamer stopped"),
        Ok((container_id, Err(e))) => {
            warn!(%container_id, error = %e, "Streamer stopped with error");
        }
        Err(e) => warn!(error = %e, "Streamer stop task failed"),
    }
}

// ============================================================================
// Watcher Handle
// ============================================================================

/// A watcher running on its own task
pub struct WatcherHandle {
    monitor: WatcherMonitor,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl WatcherHandle {
    /// Start `watcher` and move it onto a task
    pub async fn start(mut watcher: ContainerWatcher) -> Result<Self> {
        if let Err(e) = watcher.start().await {
            watcher.stop().await;
            return Err(e);
        }

        let monitor = watcher.monitor();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let result = watcher.run(shutdown_rx).await;
            watcher.stop().await;
            result
        });

        Ok(Self {
            monitor,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn monitor(&self) -> WatcherMonitor {
        self.monitor.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the watcher and every streamer it owns
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_defaults() {
        let monitor = WatcherMonitor::default();
        let stats = monitor.get_watcher_stats();
        assert!(!stats.running);
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.runtime_seconds, 0.0);
        assert!(monitor.get_active_streamers().is_empty());
    }

    #[test]
    fn test_monitor_registry() {
        let monitor = WatcherMonitor::default();
        monitor.register("c1", Arc::new(StreamerCounters::new("c1")));
        monitor.set_running(true);
        let active = monitor.get_active_streamers();
        assert_eq!(active.len(), 1);
        assert_eq!(active["c1"].container_id, "c1");
        assert!(monitor.get_watcher_stats().running);
        monitor.unregister("c1");
        assert_eq!(monitor.get_watcher_stats().active_count, 0);
    }
}
