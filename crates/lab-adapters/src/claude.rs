//! Claude CLI diagnosis engine.
//!
//! Each turn is one `claude -p` invocation streaming `stream-json`. The first
//! turn of a session pins a fresh `--session-id`; follow-ups `--resume` it so
//! the CLI keeps the conversation. The prompt is written to stdin.

use crate::claude_stream::ClaudeStreamParser;
use crate::process::{interrupt, next_line};
use async_trait::async_trait;
use lab_core::DiagnoseConfig;
use lab_core::diagnose::TurnNormalizer;
use lab_proto::{AiEngine, AiSession, ChunkFn, TurnError};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Time an interrupted turn gets to exit after SIGINT.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Bound on the `--version` availability probe.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const STREAM_ARGS: [&str; 5] = [
    "-p",
    "--output-format",
    "stream-json",
    "--verbose",
    "--include-partial-messages",
];

/// How the CLI is invoked.
#[derive(Debug, Clone)]
pub struct ClaudeSettings {
    pub command: String,
    /// Extra arguments appended to every invocation
    pub args: Vec<String>,
    pub turn_timeout: Duration,
    /// Working directory the CLI inspects; the server's cwd when unset
    pub working_dir: Option<PathBuf>,
}

impl Default for ClaudeSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            turn_timeout: Duration::from_secs(600),
            working_dir: None,
        }
    }
}

impl ClaudeSettings {
    pub fn from_config(config: &DiagnoseConfig, working_dir: Option<PathBuf>) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            turn_timeout: config.turn_timeout(),
            working_dir,
        }
    }
}

/// [`AiEngine`] backed by the Claude CLI.
#[derive(Debug, Clone)]
pub struct ClaudeEngine {
    settings: Arc<ClaudeSettings>,
}

impl ClaudeEngine {
    pub fn new(settings: ClaudeSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl AiEngine for ClaudeEngine {
    fn id(&self) -> &str {
        "claude"
    }

    async fn is_available(&self) -> bool {
        let mut command = Command::new(&self.settings.command);
        command
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(VERSION_PROBE_TIMEOUT, command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!(command = %self.settings.command, "Provider not available: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    async fn ask(&self, prompt: &str) -> Result<String, TurnError> {
        let session = ClaudeSession::new(Arc::clone(&self.settings));
        session
            .ask_stream(prompt, CancellationToken::new(), &|_| {})
            .await
    }

    async fn start_session(&self) -> Result<Box<dyn AiSession>, TurnError> {
        Ok(Box::new(ClaudeSession::new(Arc::clone(&self.settings))))
    }
}

/// One Claude conversation.
pub struct ClaudeSession {
    settings: Arc<ClaudeSettings>,
    session_id: String,
    /// Set once the CLI has confirmed the conversation exists
    resumable: AtomicBool,
}

impl ClaudeSession {
    fn new(settings: Arc<ClaudeSettings>) -> Self {
        Self {
            settings,
            session_id: Uuid::new_v4().to_string(),
            resumable: AtomicBool::new(false),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.settings.command);
        command.args(STREAM_ARGS);
        if self.resumable.load(Ordering::SeqCst) {
            command.args(["--resume", &self.session_id]);
        } else {
            command.args(["--session-id", &self.session_id]);
        }
        command.args(&self.settings.args);
        if let Some(dir) = &self.settings.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl AiSession for ClaudeSession {
    fn provider_session_id(&self) -> &str {
        &self.session_id
    }

    async fn ask_stream(
        &self,
        prompt: &str,
        interrupted: CancellationToken,
        on_chunk: &ChunkFn<'_>,
    ) -> Result<String, TurnError> {
        let timeout_secs = self.settings.turn_timeout.as_secs();
        let deadline = tokio::time::Instant::now() + self.settings.turn_timeout;

        let mut child = self.command().spawn().map_err(|e| {
            TurnError::Provider(format!("failed to spawn {}: {}", self.settings.command, e))
        })?;
        tracing::debug!(session_id = %self.session_id, "Claude turn started");

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::debug!("Failed to write prompt to stdin: {}", e);
            }
            // Dropping stdin closes it so the CLI sees EOF
        }

        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut normalizer = TurnNormalizer::new(timeout_secs);

        while stdout.is_some() || stderr.is_some() {
            let (line, from_stderr) = tokio::select! {
                biased;
                () = interrupted.cancelled() => {
                    interrupt(&mut child);
                    if tokio::time::timeout(INTERRUPT_GRACE, child.wait()).await.is_err() {
                        let _ = child.kill().await;
                    }
                    return normalizer.finish(Err(TurnError::StreamClosed));
                }
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(session_id = %self.session_id, "Claude turn exceeded {}s", timeout_secs);
                    let _ = child.kill().await;
                    return Err(TurnError::DeadlineExceeded { timeout_secs });
                }
                line = next_line(&mut stdout), if stdout.is_some() => (line, false),
                line = next_line(&mut stderr), if stderr.is_some() => (line, true),
            };

            let Some(line) = line else {
                if from_stderr {
                    stderr = None;
                } else {
                    stdout = None;
                }
                continue;
            };

            if from_stderr {
                normalizer.record_diagnostic(&line);
                continue;
            }
            match ClaudeStreamParser::parse_line(&line) {
                Some(event) => {
                    // A turn that dies before this (bad auth, bad flags) leaves
                    // nothing to resume
                    if event.session_id().is_some() && !self.resumable.swap(true, Ordering::SeqCst)
                    {
                        tracing::debug!(session_id = %self.session_id, "Claude conversation created");
                    }
                    for provider_event in event.into_provider_events() {
                        normalizer.apply(provider_event, on_chunk);
                    }
                }
                None if line.trim().is_empty() => {}
                None => normalizer.record_diagnostic(&line),
            }
        }

        match child.wait().await {
            Ok(status) if !status.success() => {
                normalizer
                    .record_diagnostic(&format!("{} exited with {}", self.settings.command, status));
            }
            Ok(_) => {}
            Err(e) => normalizer.record_diagnostic(&format!("wait failed: {e}")),
        }
        normalizer.finish(Ok(()))
    }

    async fn close(&self) -> Result<(), TurnError> {
        // The CLI keeps no process between turns; an in-flight turn is
        // stopped through its interrupt token
        tracing::debug!(session_id = %self.session_id, "Claude session released");
        Ok(())
    }
}
