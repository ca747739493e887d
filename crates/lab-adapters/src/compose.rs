//! Docker Compose orchestration backend.
//!
//! Every operation shells out to `<runtime> compose [-f FILE] ...` inside the
//! stack's project directory. Compose writes its progress to stderr, which
//! `up`/`down` forward line by line as progress events.

use crate::process::{interrupt, next_line};
use async_trait::async_trait;
use lab_core::{ServiceOverride, StackConfig};
use lab_proto::{Backend, BackendError, LogSource, ProgressEvent, ProgressFn, ServiceStatus};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Time a cancelled `up` gets to exit after SIGINT before it is killed.
const INTERRUPT_GRACE: Duration = Duration::from_secs(10);

/// Stderr lines kept for the error message of a failed command.
const ERROR_TAIL_LINES: usize = 5;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected compose output: {0}")]
    Parse(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<ComposeError> for BackendError {
    fn from(e: ComposeError) -> Self {
        match &e {
            ComposeError::Cancelled => BackendError::Cancelled,
            ComposeError::Spawn { command, .. } | ComposeError::Failed { command, .. } => {
                BackendError::Command {
                    command: command.clone(),
                    message: e.to_string(),
                }
            }
            ComposeError::Parse(message) => BackendError::Other(message.clone()),
        }
    }
}

/// One entry of `compose ps --format json`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PsEntry {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub publishers: Vec<Publisher>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Publisher {
    #[serde(default)]
    pub published_port: u16,
}

/// Parses `compose ps --format json`, which older Compose releases print as
/// one JSON array and newer ones as one object per line.
pub fn parse_ps_output(stdout: &str) -> Result<Vec<PsEntry>, ComposeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ComposeError::Parse(e.to_string()));
    }
    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| ComposeError::Parse(e.to_string())))
        .collect()
}

/// Backend for one Compose project.
#[derive(Debug, Clone)]
pub struct ComposeBackend {
    runtime: String,
    project_dir: PathBuf,
    compose_file: Option<PathBuf>,
    overrides: HashMap<String, ServiceOverride>,
}

impl ComposeBackend {
    pub fn new(runtime: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            project_dir: project_dir.into(),
            compose_file: None,
            overrides: HashMap::new(),
        }
    }

    pub fn from_config(stack: &StackConfig) -> Self {
        Self {
            runtime: stack.runtime.clone(),
            project_dir: stack.project_dir.clone(),
            compose_file: stack.compose_file.clone(),
            overrides: stack.services.clone(),
        }
    }

    pub fn with_compose_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.compose_file = Some(file.into());
        self
    }

    pub fn with_override(mut self, service: impl Into<String>, overrides: ServiceOverride) -> Self {
        self.overrides.insert(service.into(), overrides);
        self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.runtime);
        command.arg("compose");
        if let Some(file) = &self.compose_file {
            command.arg("-f").arg(file);
        }
        command
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} compose {}", self.runtime, args.join(" "))
    }

    /// Runs a short command to completion and returns its stdout.
    async fn run(&self, args: &[&str]) -> Result<String, ComposeError> {
        let command = self.describe(args);
        tracing::debug!("Running {}", command);
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|source| ComposeError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ComposeError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs a long command, forwarding every output line as progress.
    async fn run_with_progress(
        &self,
        phase: &str,
        args: &[&str],
        cancel: &CancellationToken,
        progress: &ProgressFn,
    ) -> Result<(), ComposeError> {
        let command = self.describe(args);
        tracing::info!("Running {}", command);
        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ComposeError::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut recent: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);

        while stdout.is_some() || stderr.is_some() {
            let (line, from_stderr) = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    interrupt(&mut child);
                    if tokio::time::timeout(INTERRUPT_GRACE, child.wait()).await.is_err() {
                        tracing::warn!("{} ignored SIGINT, killing", command);
                        let _ = child.kill().await;
                    }
                    return Err(ComposeError::Cancelled);
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
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if recent.len() == ERROR_TAIL_LINES {
                recent.pop_front();
            }
            recent.push_back(line.to_string());
            progress(ProgressEvent::new(phase, line));
        }

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                interrupt(&mut child);
                let _ = child.wait().await;
                return Err(ComposeError::Cancelled);
            }
            status = child.wait() => status.map_err(|source| ComposeError::Spawn {
                command: command.clone(),
                source,
            })?,
        };

        if status.success() {
            Ok(())
        } else {
            Err(ComposeError::Failed {
                command,
                status: status.to_string(),
                stderr: Vec::from(recent).join("\n"),
            })
        }
    }

    /// Every service declared by the project, running or not.
    async fn declared_services(&self) -> Result<Vec<String>, ComposeError> {
        let stdout = self.run(&["config", "--services"]).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn ensure_declared(&self, name: &str) -> Result<(), BackendError> {
        if self.declared_services().await?.iter().any(|s| s == name) {
            Ok(())
        } else {
            Err(BackendError::ServiceNotFound(name.to_string()))
        }
    }

    fn status_of(&self, name: &str, entry: Option<&PsEntry>) -> ServiceStatus {
        let overrides = self.overrides.get(name);
        let mut status = ServiceStatus::stopped(name);
        if let Some(entry) = entry {
            status.running = entry.state.eq_ignore_ascii_case("running");
            status.state = entry.state.clone();
            status.port = entry
                .publishers
                .iter()
                .map(|p| p.published_port)
                .find(|p| *p > 0);
        }
        if let Some(overrides) = overrides {
            status.port = overrides.port.or(status.port);
            status.health_url = overrides.health_url.clone();
        }
        status
    }
}

#[async_trait]
impl Backend for ComposeBackend {
    async fn get_services(&self) -> Result<Vec<ServiceStatus>, BackendError> {
        let declared = self.declared_services().await?;
        let entries = parse_ps_output(&self.run(&["ps", "--all", "--format", "json"]).await?)?;

        Ok(declared
            .iter()
            .map(|name| self.status_of(name, entries.iter().find(|e| &e.service == name)))
            .collect())
    }

    async fn up(&self, cancel: CancellationToken, progress: ProgressFn) -> Result<(), BackendError> {
        self.run_with_progress("up", &["up", "-d"], &cancel, &progress)
            .await
            .map_err(Into::into)
    }

    async fn down(&self, progress: ProgressFn) -> Result<(), BackendError> {
        self.run_with_progress("down", &["down"], &CancellationToken::new(), &progress)
            .await
            .map_err(Into::into)
    }

    async fn start_service(&self, name: &str) -> Result<(), BackendError> {
        self.ensure_declared(name).await?;
        self.run(&["start", name]).await?;
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<(), BackendError> {
        self.ensure_declared(name).await?;
        self.run(&["stop", name]).await?;
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> Result<(), BackendError> {
        self.ensure_declared(name).await?;
        self.run(&["restart", name]).await?;
        Ok(())
    }

    async fn rebuild_service(&self, name: &str) -> Result<(), BackendError> {
        self.ensure_declared(name).await?;
        self.run(&["up", "-d", "--build", "--no-deps", name]).await?;
        Ok(())
    }

    async fn log_source(&self, name: &str) -> Result<LogSource, BackendError> {
        if let Some(path) = self.overrides.get(name).and_then(|o| o.log_file.clone()) {
            let path = if path.is_relative() {
                self.project_dir.join(path)
            } else {
                path
            };
            return Ok(LogSource::File { path });
        }

        self.ensure_declared(name).await?;
        let stdout = self.run(&["ps", "-q", name]).await?;
        stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|id| LogSource::Container { id: id.to_string() })
            .ok_or_else(|| BackendError::Other(format!("service {name} has no container")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_ps_array_and_ndjson() {
        let array = r#"[{"Service":"api","State":"running","Publishers":[{"PublishedPort":0},{"PublishedPort":8080}]}]"#;
        let entries = parse_ps_output(array).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].service, "api");
        assert_eq!(entries[0].publishers[1].published_port, 8080);

        let ndjson = "{\"Service\":\"api\",\"State\":\"running\"}\n{\"Service\":\"db\",\"State\":\"exited\"}\n";
        let entries = parse_ps_output(ndjson).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].state, "exited");
        assert!(entries[1].publishers.is_empty());

        assert!(parse_ps_output("  \n").unwrap().is_empty());
        assert!(matches!(parse_ps_output("not json"), Err(ComposeError::Parse(_))));
    }

    #[test]
    fn test_status_applies_overrides() {
        let backend = ComposeBackend::new("docker", ".").with_override(
            "api",
            ServiceOverride {
                health_url: Some("http://localhost:8080/health".into()),
                port: Some(9000),
                log_file: None,
            },
        );
        let entry = PsEntry {
            service: "api".into(),
            state: "running".into(),
            publishers: vec![Publisher {
                published_port: 8080,
            }],
        };

        let status = backend.status_of("api", Some(&entry));
        assert!(status.running);
        assert_eq!(status.port, Some(9000));
        assert_eq!(
            status.health_url.as_deref(),
            Some("http://localhost:8080/health")
        );

        let missing = backend.status_of("db", None);
        assert!(!missing.running);
        assert_eq!(missing.port, None);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            BackendError::from(ComposeError::Cancelled),
            BackendError::Cancelled
        );
        let failed = ComposeError::Failed {
            command: "docker compose up -d".into(),
            status: "exit status: 1".into(),
            stderr: "no such image".into(),
        };
        match BackendError::from(failed) {
            BackendError::Command { command, message } => {
                assert_eq!(command, "docker compose up -d");
                assert!(message.contains("no such image"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_file_override_resolves_against_project_dir() {
        let backend = ComposeBackend::new("docker", "/srv/lab").with_override(
            "api",
            ServiceOverride {
                log_file: Some("logs/api.log".into()),
                ..ServiceOverride::default()
            },
        );
        assert_eq!(
            backend.log_source("api").await.unwrap(),
            LogSource::File {
                path: PathBuf::from("/srv/lab/logs/api.log")
            }
        );
    }

    #[cfg(unix)]
    mod fake_runtime {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        const SCRIPT: &str = r#"#!/bin/sh
shift
echo "$*" >> calls.log
case "$1" in
  config) printf 'api\ndb\n' ;;
  ps)
    if [ "$2" = "-q" ]; then
      if [ "$3" = "api" ]; then echo c0ffee; fi
    else
      echo '{"Service":"api","State":"running","Publishers":[{"PublishedPort":8080}]}'
    fi ;;
  up)
    [ "$2" = "-d" ] && [ -z "$3" ] || exit 0
    echo "Container api Starting" >&2
    echo "Container api Started" >&2 ;;
  down) echo "Container api Removed" >&2 ;;
  stop) echo "boom" >&2; exit 3 ;;
esac
"#;

        const SLOW_UP: &str = "#!/bin/sh\necho \"Container api Starting\" >&2\nexec sleep 30\n";

        fn fake(script: &str) -> Option<(TempDir, ComposeBackend)> {
            if !std::path::Path::new("/bin/sh").exists() {
                eprintln!("Skipping test: /bin/sh not available");
                return None;
            }
            let dir = tempfile::tempdir().unwrap();
            let runtime = dir.path().join("fake-docker");
            std::fs::write(&runtime, script).unwrap();
            std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();
            let backend = ComposeBackend::new(runtime.to_string_lossy(), dir.path());
            Some((dir, backend))
        }

        fn collect() -> (ProgressFn, Arc<Mutex<Vec<ProgressEvent>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let progress: ProgressFn = Arc::new(move |event| sink.lock().unwrap().push(event));
            (progress, seen)
        }

        #[tokio::test]
        async fn test_get_services_merges_declared_and_ps() {
            let Some((_dir, backend)) = fake(SCRIPT) else { return };
            let services = backend.get_services().await.unwrap();

            assert_eq!(services.len(), 2);
            assert_eq!(services[0].name, "api");
            assert!(services[0].running);
            assert_eq!(services[0].port, Some(8080));
            assert_eq!(services[1].name, "db");
            assert!(!services[1].running);
        }

        #[tokio::test]
        async fn test_up_forwards_progress() {
            let Some((_dir, backend)) = fake(SCRIPT) else { return };
            let (progress, seen) = collect();

            backend.up(CancellationToken::new(), progress).await.unwrap();

            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[1], ProgressEvent::new("up", "Container api Started"));
        }

        #[tokio::test]
        async fn test_service_actions() {
            let Some((dir, backend)) = fake(SCRIPT) else { return };

            backend.restart_service("api").await.unwrap();
            backend.rebuild_service("db").await.unwrap();
            assert_eq!(
                backend.start_service("ghost").await,
                Err(BackendError::ServiceNotFound("ghost".into()))
            );
            match backend.stop_service("api").await {
                Err(BackendError::Command { message, .. }) => assert!(message.contains("boom")),
                other => panic!("unexpected {other:?}"),
            }

            let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
            assert!(calls.contains("restart api"));
            assert!(calls.contains("up -d --build --no-deps db"));
        }

        #[tokio::test]
        async fn test_log_source_uses_container_id() {
            let Some((_dir, backend)) = fake(SCRIPT) else { return };
            assert_eq!(
                backend.log_source("api").await.unwrap(),
                LogSource::Container {
                    id: "c0ffee".into()
                }
            );
            assert!(matches!(
                backend.log_source("db").await,
                Err(BackendError::Other(_))
            ));
        }

        #[tokio::test]
        async fn test_cancelled_up_interrupts_child() {
            let Some((_dir, backend)) = fake(SLOW_UP) else { return };
            let (progress, _seen) = collect();
            let cancel = CancellationToken::new();

            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let result = tokio::time::timeout(Duration::from_secs(15), backend.up(cancel, progress))
                .await
                .unwrap();
            assert_eq!(result, Err(BackendError::Cancelled));
        }
    }
}
