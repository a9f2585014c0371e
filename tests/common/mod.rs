//! Shared fakes for the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use parking_lot::Mutex;

use docklens::core::{ChunkMetadata, ContainerSnapshot, LogChunk, LogLevel, SemanticIndex};
use docklens::rag::{Completer, Embedder, HashEmbedder, RerankHit, Reranker};
use docklens::runtime::{
    Container, ContainerRuntime, ContainerStatus, EventFeed, LogStream, RuntimeEvent,
};
use docklens::{Error, Result};

pub const DIM: usize = 256;

type LineSender = Sender<std::io::Result<Vec<u8>>>;
type EventSender = Sender<Result<RuntimeEvent>>;

/// In-process runtime. Tests push log lines and events through it.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, Container>>,
    logs: Arc<Mutex<HashMap<String, (u64, LineSender)>>>,
    events: Arc<Mutex<Option<EventSender>>>,
    stream_count: AtomicUsize,
    pub unavailable: AtomicBool,
    pub fail_logs: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, id: &str, name: &str, status: ContainerStatus) {
        let mut container = Container::new(id, name, status);
        container.image = "nginx:latest".into();
        container.env = vec!["SECRET=hunter2".into(), "PORT=80".into()];
        self.containers.lock().insert(id.to_string(), container);
    }

    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        if let Some(c) = self.containers.lock().get_mut(id) {
            c.status = status;
        }
    }

    /// Push one raw line to the current log stream of `id`
    pub fn push_bytes(&self, id: &str, bytes: Vec<u8>) -> bool {
        match self.logs.lock().get(id) {
            Some((_, tx)) => tx.send(Ok(bytes)).is_ok(),
            None => false,
        }
    }

    pub fn push_line(&self, id: &str, line: &str) -> bool {
        self.push_bytes(id, line.as_bytes().to_vec())
    }

    pub fn has_stream(&self, id: &str) -> bool {
        self.logs.lock().contains_key(id)
    }

    pub fn streams_opened(&self) -> usize {
        self.stream_count.load(Ordering::SeqCst)
    }

    /// End the log stream of `id` as if the container's output closed
    pub fn end_logs(&self, id: &str) {
        self.logs.lock().remove(id);
    }

    pub fn emit(&self, event: Result<RuntimeEvent>) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn end_events(&self) {
        self.events.lock().take();
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::RuntimeUnavailable("fake runtime is down".into()));
        }
        Ok(())
    }
}

impl ContainerRuntime for FakeRuntime {
    fn list_containers(&self, all: bool) -> Result<Vec<Container>> {
        self.check()?;
        let mut list: Vec<Container> = self
            .containers
            .lock()
            .values()
            .filter(|c| all || c.is_running())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    fn get_container(&self, id: &str) -> Result<Container> {
        self.check()?;
        self.containers
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn stream_logs(&self, id: &str) -> Result<LogStream> {
        self.check()?;
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(Error::RuntimeUnavailable("log stream refused".into()));
        }
        let generation = self.stream_count.fetch_add(1, Ordering::SeqCst) as u64;
        let (tx, rx) = channel();
        self.logs.lock().insert(id.to_string(), (generation, tx));

        let logs = Arc::clone(&self.logs);
        let key = id.to_string();
        Ok(LogStream::new(rx.into_iter()).with_abort(move || {
            let mut logs = logs.lock();
            if logs.get(&key).map(|(g, _)| *g) == Some(generation) {
                logs.remove(&key);
            }
        }))
    }

    fn events(&self) -> Result<EventFeed> {
        self.check()?;
        let (tx, rx) = channel();
        *self.events.lock() = Some(tx);
        let events = Arc::clone(&self.events);
        Ok(EventFeed::new(rx.into_iter()).with_abort(move || {
            events.lock().take();
        }))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Hash embedder that can be switched into failure
pub struct FlakyEmbedder {
    inner: HashEmbedder,
    pub failing: AtomicBool,
    pub batch_calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbedder::new(DIM),
            failing: AtomicBool::new(false),
            batch_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Embedder for FlakyEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("embedding service returned 503");
        }
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("embedding service returned 503");
        }
        self.inner.embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn backend(&self) -> &str {
        "flaky"
    }
}

/// Hash embedder whose batch calls take `delay` to return
pub struct SlowEmbedder {
    inner: HashEmbedder,
    delay: Duration,
}

impl SlowEmbedder {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbedder::new(DIM),
            delay,
        })
    }
}

impl Embedder for SlowEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        std::thread::sleep(self.delay);
        self.inner.embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn backend(&self) -> &str {
        "slow"
    }
}

pub struct FailingReranker;

impl Reranker for FailingReranker {
    fn rerank(&self, _query: &str, _documents: &[&str], _top_k: usize) -> anyhow::Result<Vec<RerankHit>> {
        bail!("rerank service returned 500")
    }

    fn model(&self) -> &str {
        "failing"
    }
}

pub struct EmptyReranker;

impl Reranker for EmptyReranker {
    fn rerank(&self, _query: &str, _documents: &[&str], _top_k: usize) -> anyhow::Result<Vec<RerankHit>> {
        Ok(Vec::new())
    }

    fn model(&self) -> &str {
        "empty"
    }
}

/// Scores candidates in reverse input order, unsorted on the way out
pub struct ReverseReranker;

impl Reranker for ReverseReranker {
    fn rerank(&self, _query: &str, documents: &[&str], _top_k: usize) -> anyhow::Result<Vec<RerankHit>> {
        let n = documents.len();
        let hits = documents
            .iter()
            .enumerate()
            .map(|(index, text)| RerankHit {
                text: text.to_string(),
                score: (index + 1) as f32 / n as f32,
                index,
            })
            .collect();
        Ok(hits)
    }

    fn model(&self) -> &str {
        "reverse"
    }
}

/// Records every prompt it is given
#[derive(Default)]
pub struct RecordingCompleter {
    pub prompts: Mutex<Vec<String>>,
}

impl Completer for RecordingCompleter {
    fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self.prompts.lock().push(prompt.to_string());
        Ok("The database connection was refused at startup.".to_string())
    }

    fn model(&self) -> &str {
        "recording"
    }
}

pub fn chunk(container_id: &str, text: &str, level: LogLevel, sequence: u64) -> LogChunk {
    LogChunk {
        id: LogChunk::new_id(container_id),
        text: text.to_string(),
        metadata: ChunkMetadata {
            container_id: container_id.to_string(),
            timestamp: chrono::Utc::now(),
            sequence,
            chunk_index: 0,
            total_chunks: 1,
            line_count: text.matches('\n').count() + 1,
            char_count: text.chars().count(),
            log_level: level,
            severity_score: level.severity(),
            has_error: level == LogLevel::Error,
            has_warning: level == LogLevel::Warn,
            error_count: usize::from(level == LogLevel::Error),
            warning_count: usize::from(level == LogLevel::Warn),
            container: ContainerSnapshot {
                name: format!("{container_id}-name"),
                ..ContainerSnapshot::unknown()
            },
            extra: BTreeMap::new(),
        },
    }
}

/// Index a handful of chunks with the hash embedder
pub fn seed(index: &SemanticIndex, chunks: &[LogChunk]) {
    let embedder = HashEmbedder::new(DIM);
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let vectors = embedder.embed_batch(&texts).unwrap();
    index.upsert(chunks, &vectors).unwrap();
}

/// Rerank hits that name the same candidate twice
pub struct RepeatingReranker;

impl Reranker for RepeatingReranker {
    fn rerank(&self, _query: &str, documents: &[&str], _top_k: usize) -> anyhow::Result<Vec<RerankHit>> {
        let hit = |index: usize, score: f32| RerankHit {
            text: documents.get(index).map(|d| d.to_string()).unwrap_or_default(),
            score,
            index,
        };
        Ok(vec![hit(0, 0.9), hit(0, 0.8), hit(1, 0.5)])
    }

    fn model(&self) -> &str {
        "repeating"
    }
}

/// Poll `cond` until it holds or two seconds pass
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// `wait_for` for paused-clock tests: waits in real time, leaves the tokio clock alone
pub async fn settle(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
        tokio::task::yield_now().await;
    }
    cond()
}
