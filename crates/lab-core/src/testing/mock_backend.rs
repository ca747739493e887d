//! Mock orchestration backend for deterministic testing.

use crate::lock;
use async_trait::async_trait;
use lab_proto::{
    Backend, BackendError, LogSource, ProgressEvent, ProgressFn, ServiceStatus,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backend that simulates a stack in memory.
///
/// `up` marks every service running and `down` marks every service stopped,
/// unless scripted otherwise.
#[derive(Debug, Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    services: Vec<ServiceStatus>,
    progress: Vec<ProgressEvent>,
    up_delay: Option<Duration>,
    block_up: bool,
    up_error: Option<String>,
    down_error: Option<String>,
    services_error: Option<String>,
    log_sources: HashMap<String, LogSource>,
    calls: Vec<String>,
}

impl MockBackend {
    /// Creates a mock stack with the given services.
    pub fn new(services: Vec<ServiceStatus>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                services,
                ..MockState::default()
            })),
        }
    }

    /// Creates a mock stack of stopped services with the given names.
    pub fn with_stopped(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| ServiceStatus::stopped(*n)).collect())
    }

    /// Progress steps reported by every `up` before it finishes.
    pub fn set_progress(&self, steps: Vec<ProgressEvent>) {
        lock(&self.state).progress = steps;
    }

    /// Makes `up` take this long (cancellable).
    pub fn set_up_delay(&self, delay: Duration) {
        lock(&self.state).up_delay = Some(delay);
    }

    /// Makes `up` start the first service and then wait for cancellation.
    pub fn block_up_until_cancelled(&self) {
        lock(&self.state).block_up = true;
    }

    pub fn fail_up(&self, message: impl Into<String>) {
        lock(&self.state).up_error = Some(message.into());
    }

    pub fn fail_down(&self, message: impl Into<String>) {
        lock(&self.state).down_error = Some(message.into());
    }

    pub fn fail_get_services(&self, message: impl Into<String>) {
        lock(&self.state).services_error = Some(message.into());
    }

    pub fn set_running(&self, name: &str, running: bool) {
        let mut state = lock(&self.state);
        if let Some(service) = state.services.iter_mut().find(|s| s.name == name) {
            service.running = running;
            service.state = if running { "running" } else { "exited" }.to_string();
        }
    }

    pub fn set_log_source(&self, name: &str, source: LogSource) {
        lock(&self.state).log_sources.insert(name.to_string(), source);
    }

    /// Names of the backend operations called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn running_count(&self) -> usize {
        lock(&self.state).services.iter().filter(|s| s.running).count()
    }

    fn record(&self, call: impl Into<String>) {
        lock(&self.state).calls.push(call.into());
    }

    fn set_all_running(&self, running: bool) {
        let names: Vec<String> = lock(&self.state)
            .services
            .iter()
            .map(|s| s.name.clone())
            .collect();
        for name in names {
            self.set_running(&name, running);
        }
    }

    fn ensure_exists(&self, name: &str) -> Result<(), BackendError> {
        if lock(&self.state).services.iter().any(|s| s.name == name) {
            Ok(())
        } else {
            Err(BackendError::ServiceNotFound(name.to_string()))
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_services(&self) -> Result<Vec<ServiceStatus>, BackendError> {
        let state = lock(&self.state);
        match &state.services_error {
            Some(message) => Err(BackendError::Other(message.clone())),
            None => Ok(state.services.clone()),
        }
    }

    async fn up(&self, cancel: CancellationToken, progress: ProgressFn) -> Result<(), BackendError> {
        self.record("up");
        let (steps, delay, block, error) = {
            let state = lock(&self.state);
            (
                state.progress.clone(),
                state.up_delay,
                state.block_up,
                state.up_error.clone(),
            )
        };

        for step in steps {
            progress(step);
        }

        if block {
            if let Some(first) = lock(&self.state).services.first_mut() {
                first.running = true;
                first.state = "running".to_string();
            }
            cancel.cancelled().await;
            return Err(BackendError::Cancelled);
        }

        if let Some(delay) = delay {
            tokio::select! {
                () = cancel.cancelled() => return Err(BackendError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(message) = error {
            return Err(BackendError::Command {
                command: "up".to_string(),
                message,
            });
        }

        self.set_all_running(true);
        Ok(())
    }

    async fn down(&self, progress: ProgressFn) -> Result<(), BackendError> {
        self.record("down");
        progress(ProgressEvent::new("down", "stopping services"));

        let error = lock(&self.state).down_error.clone();
        if let Some(message) = error {
            return Err(BackendError::Command {
                command: "down".to_string(),
                message,
            });
        }

        self.set_all_running(false);
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<(), BackendError> {
        self.record(format!("start:{name}"));
        self.ensure_exists(name)?;
        self.set_running(name, true);
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<(), BackendError> {
        self.record(format!("stop:{name}"));
        self.ensure_exists(name)?;
        self.set_running(name, false);
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> Result<(), BackendError> {
        self.record(format!("restart:{name}"));
        self.ensure_exists(name)?;
        self.set_running(name, true);
        Ok(())
    }

    async fn rebuild_service(&self, name: &str) -> Result<(), BackendError> {
        self.record(format!("rebuild:{name}"));
        self.ensure_exists(name)?;
        self.set_running(name, true);
        Ok(())
    }

    async fn log_source(&self, name: &str) -> Result<LogSource, BackendError> {
        self.ensure_exists(name)?;
        let state = lock(&self.state);
        Ok(state.log_sources.get(name).cloned().unwrap_or_else(|| LogSource::File {
            path: PathBuf::from(format!("/tmp/lab-mock/{name}.log")),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_proto::noop_progress;

    #[tokio::test]
    async fn test_up_and_down_toggle_services() {
        let backend = MockBackend::with_stopped(&["api", "db"]);
        backend
            .up(CancellationToken::new(), noop_progress())
            .await
            .unwrap();
        assert_eq!(backend.running_count(), 2);

        backend.down(noop_progress()).await.unwrap();
        assert_eq!(backend.running_count(), 0);
        assert_eq!(backend.calls(), vec!["up", "down"]);
    }

    #[tokio::test]
    async fn test_blocked_up_observes_cancel() {
        let backend = MockBackend::with_stopped(&["api", "db"]);
        backend.block_up_until_cancelled();

        let token = CancellationToken::new();
        token.cancel();
        let result = backend.up(token, noop_progress()).await;
        assert_eq!(result, Err(BackendError::Cancelled));
        // Partially started
        assert_eq!(backend.running_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let backend = MockBackend::with_stopped(&["api"]);
        let err = backend.start_service("nope").await.unwrap_err();
        assert_eq!(err, BackendError::ServiceNotFound("nope".to_string()));
    }
}
