//! Per-service log tailing.
//!
//! One detached task per service follows its output through an external
//! process (`tail -F` for files, `<runtime> logs -f` for containers) and
//! sends parsed lines into a shared sink. Stopping a tail kills the process:
//! `tail -F` would otherwise keep following a rotated or deleted file across
//! a service restart.

use super::parse_line;
use crate::lock;
use lab_proto::{Backend, LogLine, LogSource, ServiceStatus};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the channel carrying parsed lines out of the pipeline.
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Default number of lines replayed when a tail starts.
pub const DEFAULT_TAIL_BACKLOG: usize = 100;

struct TailHandle {
    id: u64,
    cancel: CancellationToken,
}

struct PipelineInner {
    tails: Mutex<HashMap<String, TailHandle>>,
    sink: mpsc::Sender<LogLine>,
    runtime: String,
    backlog: usize,
    next_id: AtomicU64,
}

impl PipelineInner {
    /// Removes a tail entry only if it still belongs to the exiting task.
    fn remove_if_current(&self, service: &str, id: u64) {
        let mut tails = lock(&self.tails);
        if tails.get(service).is_some_and(|h| h.id == id) {
            tails.remove(service);
        }
    }
}

/// Registry of running log tails for one stack.
#[derive(Clone)]
pub struct LogPipeline {
    inner: Arc<PipelineInner>,
}

impl LogPipeline {
    /// Creates a pipeline and the receiver its parsed lines arrive on.
    ///
    /// `runtime` is the container runtime executable used for container
    /// sources.
    pub fn new(runtime: impl Into<String>, backlog: usize) -> (Self, mpsc::Receiver<LogLine>) {
        let (sink, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let pipeline = Self {
            inner: Arc::new(PipelineInner {
                tails: Mutex::new(HashMap::new()),
                sink,
                runtime: runtime.into(),
                backlog,
                next_id: AtomicU64::new(1),
            }),
        };
        (pipeline, rx)
    }

    /// Starts tailing `service`. Returns `false` if it is already tailed.
    pub fn start(&self, service: &str, source: LogSource) -> bool {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut tails = lock(&self.inner.tails);
            if tails.contains_key(service) {
                return false;
            }
            tails.insert(
                service.to_string(),
                TailHandle {
                    id,
                    cancel: cancel.clone(),
                },
            );
        }

        tracing::info!(service, tail = id, source = ?source, "Starting log tail");
        let inner = Arc::clone(&self.inner);
        let service = service.to_string();
        tokio::spawn(async move {
            run_tail(&inner, &service, &source, &cancel).await;
            inner.remove_if_current(&service, id);
            tracing::debug!(service, tail = id, "Log tail exited");
        });
        true
    }

    /// Stops tailing `service`, killing its tail process. Returns `false` if
    /// it was not tailed.
    pub fn stop(&self, service: &str) -> bool {
        let removed = lock(&self.inner.tails).remove(service);
        match removed {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(service, tail = handle.id, "Stopped log tail");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<(String, TailHandle)> = lock(&self.inner.tails).drain().collect();
        for (_, handle) in drained {
            handle.cancel.cancel();
        }
    }

    /// Names of the services currently tailed, sorted.
    pub fn active_services(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.tails).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_tailing(&self, service: &str) -> bool {
        lock(&self.inner.tails).contains_key(service)
    }

    /// Identifier of the task tailing `service`; changes on every restart.
    pub fn tail_id(&self, service: &str) -> Option<u64> {
        lock(&self.inner.tails).get(service).map(|h| h.id)
    }

    /// Aligns the running tails with the services currently running.
    pub async fn reconcile(&self, backend: &dyn Backend, services: &[ServiceStatus]) {
        let running: HashSet<&str> = services
            .iter()
            .filter(|s| s.running)
            .map(|s| s.name.as_str())
            .collect();

        for name in self.active_services() {
            if !running.contains(name.as_str()) {
                self.stop(&name);
            }
        }

        for name in running {
            if self.is_tailing(name) {
                continue;
            }
            match backend.log_source(name).await {
                Ok(source) => {
                    self.start(name, source);
                }
                Err(e) => tracing::warn!(service = name, "No log source: {}", e),
            }
        }
    }
}

async fn run_tail(
    inner: &PipelineInner,
    service: &str,
    source: &LogSource,
    cancel: &CancellationToken,
) {
    let backlog = inner.backlog.to_string();
    let (mut command, forward_stderr) = match source {
        LogSource::File { path } => {
            let mut command = Command::new("tail");
            command.args(["-n", &backlog, "-F"]).arg(path);
            (command, false)
        }
        LogSource::Container { id } => {
            let mut command = Command::new(&inner.runtime);
            command.args(["logs", "-f", "--tail", &backlog, id]);
            (command, true)
        }
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(service, "Failed to spawn log tail: {}", e);
            return;
        }
    };

    // Container output arrives on both streams; read them concurrently so a
    // quiet stream never stalls the other.
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

    while stdout.is_some() || stderr.is_some() {
        let (line, from_stderr) = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = next_line(&mut stdout), if stdout.is_some() => (line, false),
            line = next_line(&mut stderr), if stderr.is_some() => (line, true),
        };

        let Some(raw) = line else {
            if from_stderr {
                stderr = None;
            } else {
                stdout = None;
            }
            continue;
        };

        if from_stderr && !forward_stderr {
            tracing::debug!(service, "tail: {}", raw);
            continue;
        }
        if inner.sink.send(parse_line(service, &raw)).await.is_err() {
            break;
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(service, "Tail process already gone: {}", e);
    }
}

/// Next line of an optional reader; `None` on EOF or read error.
async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}
