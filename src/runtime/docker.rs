//! Docker runtime via the `docker` CLI
//!
//! Shells out instead of speaking the Engine API directly: `inspect` and
//! `ps` for descriptions, `logs --follow` and `events` as long-running
//! children whose stdout is read line by line.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Output, Stdio};
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Container, ContainerRuntime, ContainerStatus, EventFeed, LogStream, RuntimeEvent};
use crate::error::{Error, Result};

/// `docker` command line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run to completion; non-zero exit becomes NotFound or RuntimeUnavailable
    fn run(&self, args: &[&str], subject: &str) -> Result<Output> {
        let output = self
            .command()
            .args(args)
            .output()
            .map_err(|e| Error::RuntimeUnavailable(format!("failed to run {}: {}", self.bin, e)))?;

        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(&stderr, subject))
    }

    fn spawn(&self, args: &[&str], stderr: Stdio) -> Result<Child> {
        self.command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(stderr)
            .spawn()
            .map_err(|e| Error::RuntimeUnavailable(format!("failed to spawn {}: {}", self.bin, e)))
    }

    fn inspect(&self, ids: &[&str]) -> Result<Vec<Container>> {
        let mut args = vec!["inspect", "--type", "container"];
        args.extend_from_slice(ids);
        let output = self.run(&args, ids.first().copied().unwrap_or_default())?;
        parse_inspect(&output.stdout)
    }
}

impl ContainerRuntime for DockerCli {
    fn list_containers(&self, all: bool) -> Result<Vec<Container>> {
        let mut args = vec!["ps", "-q", "--no-trunc"];
        if all {
            args.push("-a");
        }
        let output = self.run(&args, "")?;
        let listing = String::from_utf8_lossy(&output.stdout);
        let ids: Vec<&str> = listing.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        match self.inspect(&ids) {
            Ok(containers) => Ok(containers),
            // A container vanished between ps and inspect; describe the rest one by one
            Err(Error::NotFound(_)) => Ok(ids
                .iter()
                .filter_map(|id| self.inspect(&[*id]).ok())
                .flatten()
                .collect()),
            Err(e) => Err(e),
        }
    }

    fn get_container(&self, id: &str) -> Result<Container> {
        self.inspect(&[id])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn stream_logs(&self, id: &str) -> Result<LogStream> {
        let since = chrono::Utc::now().timestamp().to_string();
        let mut child = self.spawn(
            &["logs", "--follow", "--timestamps", "--since", &since, id],
            Stdio::piped(),
        )?;

        let (tx, rx) = mpsc::sync_channel::<std::io::Result<Vec<u8>>>(256);

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx, "stderr");
        }

        debug!(container_id = %id, "Following docker logs");
        let child = Arc::new(Mutex::new(child));
        Ok(LogStream::new(rx.into_iter()).with_abort(move || reap(&child)))
    }

    fn events(&self) -> Result<EventFeed> {
        // Nobody reads stderr here; a full pipe would stall the feed
        let mut child = self.spawn(
            &["events", "--filter", "type=container", "--format", "{{json .}}"],
            Stdio::null(),
        )?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::RuntimeUnavailable("docker events has no stdout".to_string()))?;

        let events = BufReader::new(stdout).split(b'\n').map(|line| match line {
            Ok(bytes) => parse_event(&bytes),
            Err(e) => Err(Error::EventFeed(e.to_string())),
        });

        let child = Arc::new(Mutex::new(child));
        Ok(EventFeed::new(events).with_abort(move || reap(&child)))
    }

    fn name(&self) -> &str {
        "docker"
    }
}

fn spawn_line_reader<R>(source: R, tx: mpsc::SyncSender<std::io::Result<Vec<u8>>>, label: &'static str)
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        for line in BufReader::new(source).split(b'\n') {
            if tx.send(line).is_err() {
                break;
            }
        }
        debug!(stream = label, "Log reader finished");
    });
}

fn reap(child: &Mutex<Child>) {
    let mut child = child.lock();
    if let Err(e) = child.kill() {
        // Already exited
        debug!(error = %e, "docker child kill");
    }
    if let Err(e) = child.wait() {
        warn!(error = %e, "Failed to reap docker child");
    }
}

fn classify_failure(stderr: &str, subject: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        Error::NotFound(subject.to_string())
    } else {
        Error::RuntimeUnavailable(stderr.to_string())
    }
}

// ============================================================================
// JSON Shapes
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectRecord {
    id: String,
    name: String,
    created: String,
    state: InspectState,
    config: InspectConfig,
    network_settings: InspectNetwork,
    mounts: Vec<InspectMount>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectState {
    status: String,
    started_at: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectConfig {
    image: String,
    cmd: Option<Vec<String>>,
    env: Option<Vec<String>>,
    working_dir: String,
    user: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectNetwork {
    ports: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
    networks: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct PortBinding {
    host_ip: String,
    host_port: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectMount {
    source: String,
    destination: String,
}

impl From<InspectRecord> for Container {
    fn from(r: InspectRecord) -> Self {
        let ports = r
            .network_settings
            .ports
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(container_port, bindings)| match bindings {
                Some(bindings) if !bindings.is_empty() => bindings
                    .into_iter()
                    .map(|b| format!("{}:{}->{}", b.host_ip, b.host_port, container_port))
                    .collect::<Vec<_>>(),
                _ => vec![container_port],
            })
            .collect();

        Container {
            id: r.id,
            name: r.name.trim_start_matches('/').to_string(),
            status: ContainerStatus::parse(&r.state.status),
            image: r.config.image,
            created: r.created,
            started: r.state.started_at,
            command: r.config.cmd.unwrap_or_default(),
            ports,
            env: r.config.env.unwrap_or_default(),
            working_dir: r.config.working_dir,
            user: r.config.user,
            volumes: r
                .mounts
                .into_iter()
                .map(|m| format!("{}:{}", m.source, m.destination))
                .collect(),
            networks: r.network_settings.networks.unwrap_or_default().into_keys().collect(),
        }
    }
}

/// Parse `docker inspect` output (a JSON array)
pub fn parse_inspect(json: &[u8]) -> Result<Vec<Container>> {
    let records: Vec<InspectRecord> = serde_json::from_slice(json)
        .map_err(|e| Error::RuntimeUnavailable(format!("unreadable inspect output: {e}")))?;
    Ok(records.into_iter().map(Container::from).collect())
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    #[serde(rename = "Type", alias = "type")]
    kind: String,
    #[serde(rename = "Action", default)]
    action: Option<String>,
    /// Pre-1.22 engines only send `status`
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: EventActor,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct EventActor {
    #[serde(rename = "ID")]
    id: String,
    attributes: BTreeMap<String, String>,
}

/// Parse one `docker events --format '{{json .}}'` line
pub fn parse_event(line: &[u8]) -> Result<RuntimeEvent> {
    let record: EventRecord = serde_json::from_slice(line)
        .map_err(|e| Error::EventFeed(format!("malformed event: {e}")))?;

    let actor_id = if record.actor.id.is_empty() {
        record.id.unwrap_or_default()
    } else {
        record.actor.id
    };

    let action = record
        .action
        .or(record.status)
        .ok_or_else(|| Error::EventFeed("event without action".to_string()))?;

    if actor_id.is_empty() {
        return Err(Error::EventFeed(format!("{action} event without actor id")));
    }

    Ok(RuntimeEvent {
        kind: record.kind,
        action,
        actor_id,
        attributes: record.actor.attributes,
    })
}
