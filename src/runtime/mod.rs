//! Container runtime contract
//!
//! Everything the ingestion side needs from a runtime: listing, describing,
//! following logs, and a lifecycle event feed. Log and event sources are
//! blocking iterators; callers drain them on a dedicated worker thread.

pub mod docker;

pub use docker::DockerCli;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::ContainerSnapshot;
use crate::error::{Error, Result};

// ============================================================================
// Container
// ============================================================================

/// Runtime-reported container state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container as seen by the runtime. Read-only to docklens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub image: String,
    pub created: String,
    pub started: String,
    pub command: Vec<String>,
    pub ports: Vec<String>,
    /// `KEY=value` pairs as reported by the runtime
    pub env: Vec<String>,
    pub working_dir: String,
    pub user: String,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
}

impl Container {
    /// Minimal container with only identity and state filled in
    pub fn new(id: impl Into<String>, name: impl Into<String>, status: ContainerStatus) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status,
            image: String::new(),
            created: String::new(),
            started: String::new(),
            command: Vec::new(),
            ports: Vec::new(),
            env: Vec::new(),
            working_dir: String::new(),
            user: String::new(),
            volumes: Vec::new(),
            networks: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// 12-character id as shown by `docker ps`
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}

impl From<&Container> for ContainerSnapshot {
    fn from(c: &Container) -> Self {
        ContainerSnapshot {
            name: c.name.clone(),
            status: c.status.to_string(),
            image: c.image.clone(),
            created: c.created.clone(),
            started: c.started.clone(),
            command: c.command.clone(),
            ports: c.ports.clone(),
            env_keys: c
                .env
                .iter()
                .map(|kv| kv.split_once('=').map_or(kv.as_str(), |(k, _)| k).to_string())
                .collect(),
            working_dir: c.working_dir.clone(),
            user: c.user.clone(),
            volumes: c.volumes.clone(),
            networks: c.networks.clone(),
        }
    }
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// One lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Object type, e.g. "container"
    pub kind: String,
    /// Action, e.g. "start", "stop", "die"
    pub action: String,
    pub actor_id: String,
    pub attributes: BTreeMap<String, String>,
}

impl RuntimeEvent {
    pub fn container(action: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            kind: "container".to_string(),
            action: action.into(),
            actor_id: actor_id.into(),
            attributes: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Blocking Sources
// ============================================================================

type Abort = Box<dyn FnOnce() + Send>;

/// A followed log source: raw byte lines without the trailing newline
pub struct LogStream {
    lines: Box<dyn Iterator<Item = std::io::Result<Vec<u8>>> + Send>,
    abort: Option<Abort>,
}

impl LogStream {
    pub fn new<I>(lines: I) -> Self
    where
        I: Iterator<Item = std::io::Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            lines: Box::new(lines),
            abort: None,
        }
    }

    /// Hook that unblocks a reader parked inside `next()`
    pub fn with_abort(mut self, abort: impl FnOnce() + Send + 'static) -> Self {
        self.abort = Some(Box::new(abort));
        self
    }

    pub fn into_parts(
        self,
    ) -> (
        Box<dyn Iterator<Item = std::io::Result<Vec<u8>>> + Send>,
        Option<Abort>,
    ) {
        (self.lines, self.abort)
    }
}

impl fmt::Debug for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStream")
            .field("abortable", &self.abort.is_some())
            .finish()
    }
}

/// A lifecycle event feed. Malformed records surface as `Error::EventFeed`.
pub struct EventFeed {
    events: Box<dyn Iterator<Item = Result<RuntimeEvent>> + Send>,
    abort: Option<Abort>,
}

impl EventFeed {
    pub fn new<I>(events: I) -> Self
    where
        I: Iterator<Item = Result<RuntimeEvent>> + Send + 'static,
    {
        Self {
            events: Box::new(events),
            abort: None,
        }
    }

    pub fn with_abort(mut self, abort: impl FnOnce() + Send + 'static) -> Self {
        self.abort = Some(Box::new(abort));
        self
    }

    pub fn into_parts(self) -> (Box<dyn Iterator<Item = Result<RuntimeEvent>> + Send>, Option<Abort>) {
        (self.events, self.abort)
    }
}

impl fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFeed")
            .field("abortable", &self.abort.is_some())
            .finish()
    }
}

// ============================================================================
// Runtime Trait
// ============================================================================

/// Container runtime client.
///
/// Methods block; async callers go through `spawn_blocking`.
pub trait ContainerRuntime: Send + Sync {
    /// Running containers, or every container when `all` is set
    fn list_containers(&self, all: bool) -> Result<Vec<Container>>;

    /// Describe one container. Unknown ids are `Error::NotFound`.
    fn get_container(&self, id: &str) -> Result<Container>;

    /// Follow logs from now on, with timestamps, stdout and stderr merged
    fn stream_logs(&self, id: &str) -> Result<LogStream>;

    /// Subscribe to container lifecycle events
    fn events(&self) -> Result<EventFeed>;

    /// Runtime name for logs
    fn name(&self) -> &str;
}

/// Decode one raw log line, reporting invalid UTF-8 as a decode error
pub fn decode_line(container_id: &str, raw: Vec<u8>) -> Result<String> {
    String::from_utf8(raw)
        .map(|mut line| {
            if line.ends_with('\r') {
                line.pop();
            }
            line
        })
        .map_err(|e| Error::Decode {
            container_id: container_id.to_string(),
            reason: e.utf8_error().to_string(),
        })
}
