//! Stack lifecycle controller.
//!
//! Owns the up/down/restart/cancel state machine of one stack:
//! - Long-running boot and teardown run on detached tasks, so they outlive
//!   the request that triggered them
//! - Every transition bumps an operation epoch; a background task only
//!   finalizes state while the epoch is still its own
//! - Progress and outcomes are broadcast through the stack's [`EventHub`]
//!
//! The externally reported status is derived live from the backend on every
//! query while the controller is idle.

use crate::hub::{EventHub, events};
use crate::lock;
use lab_proto::{Backend, BackendError, ProgressEvent, ProgressFn, ServiceStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default bound on a teardown.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a cancelled boot gets to wind down before teardown starts anyway.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Internal state of the lifecycle state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    #[default]
    Idle,
    Starting,
    Stopping,
}

/// Status reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    Starting,
    Stopping,
    Running,
    Stopped,
}

/// Snapshot of a stack's lifecycle as served to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackStatusView {
    pub status: StackStatus,
    pub running: usize,
    pub total: usize,
    pub last_error: Option<String>,
    pub progress: Vec<ProgressEvent>,
}

/// A per-service operation passed through to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Rebuild,
}

impl ServiceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Rebuild => "rebuild",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceAction {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "rebuild" => Ok(Self::Rebuild),
            other => Err(LifecycleError::InvalidAction(other.to_string())),
        }
    }
}

/// Errors returned by lifecycle operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// The state machine is mid-transition or the stack is already up.
    #[error("{0}")]
    Conflict(String),

    #[error("unknown service action: {0}")]
    InvalidAction(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Default)]
struct StackState {
    status: LifecycleStatus,
    last_error: Option<String>,
    cancel: Option<CancellationToken>,
    progress: Vec<ProgressEvent>,
    epoch: u64,
    boot_task: Option<JoinHandle<()>>,
}

impl StackState {
    fn ensure_idle(&self) -> Result<(), LifecycleError> {
        match self.status {
            LifecycleStatus::Idle => Ok(()),
            LifecycleStatus::Starting => Err(LifecycleError::Conflict("stack is starting".into())),
            LifecycleStatus::Stopping => Err(LifecycleError::Conflict("stack is stopping".into())),
        }
    }

    /// Starts a new operation from Idle.
    fn begin(&mut self, to: LifecycleStatus) -> u64 {
        self.status = to;
        self.last_error = None;
        self.progress.clear();
        self.cancel = None;
        self.boot_task = None;
        self.epoch += 1;
        self.epoch
    }
}

struct ControllerInner {
    backend: Arc<dyn Backend>,
    hub: EventHub,
    state: Mutex<StackState>,
    teardown_timeout: Duration,
}

/// Lifecycle controller for one stack.
#[derive(Clone)]
pub struct StackController {
    inner: Arc<ControllerInner>,
}

impl StackController {
    pub fn new(backend: Arc<dyn Backend>, hub: EventHub) -> Self {
        Self::with_teardown_timeout(backend, hub, DEFAULT_TEARDOWN_TIMEOUT)
    }

    pub fn with_teardown_timeout(
        backend: Arc<dyn Backend>,
        hub: EventHub,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                backend,
                hub,
                state: Mutex::new(StackState::default()),
                teardown_timeout,
            }),
        }
    }

    /// Boots the stack in the background.
    ///
    /// Rejected while a transition is in flight or when any service already
    /// reports running.
    pub async fn up(&self) -> Result<(), LifecycleError> {
        lock(&self.inner.state).ensure_idle()?;

        let running = match self.inner.backend.get_services().await {
            Ok(services) => services.iter().filter(|s| s.running).count(),
            Err(e) => {
                tracing::warn!("Could not list services before boot: {}", e);
                0
            }
        };

        let mut state = lock(&self.inner.state);
        // Re-checked: another request may have won the race while we queried
        state.ensure_idle()?;
        if running > 0 {
            return Err(LifecycleError::Conflict(format!(
                "stack is already running ({running} services up)"
            )));
        }
        let epoch = state.begin(LifecycleStatus::Starting);
        let token = CancellationToken::new();
        state.cancel = Some(token.clone());

        tracing::info!("Stack starting");
        self.inner.hub.notify(events::STACK_STARTING);

        // Stored in the same critical section, so cancel always finds it
        let this = self.clone();
        state.boot_task = Some(tokio::spawn(async move {
            let result = this.run_boot(token, epoch).await;
            this.finish(epoch, result, events::STACK_STARTED);
        }));
        Ok(())
    }

    /// Tears the stack down in the background.
    pub fn down(&self) -> Result<(), LifecycleError> {
        let epoch = {
            let mut state = lock(&self.inner.state);
            state.ensure_idle()?;
            state.begin(LifecycleStatus::Stopping)
        };

        tracing::info!("Stack stopping");
        self.inner.hub.notify(events::STACK_STOPPING);

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.run_teardown(epoch).await;
            this.finish(epoch, result, events::STACK_STOPPED);
        });
        Ok(())
    }

    /// Tears down and boots again.
    ///
    /// No `stack_stopped` is broadcast between the two phases, so clients
    /// never see a transient "not running" state.
    pub fn restart(&self) -> Result<(), LifecycleError> {
        let mut state = lock(&self.inner.state);
        state.ensure_idle()?;
        let epoch = state.begin(LifecycleStatus::Stopping);

        tracing::info!("Stack restarting");
        self.inner.hub.notify(events::STACK_STOPPING);

        // Cancel during the boot phase waits on this task
        let this = self.clone();
        state.boot_task = Some(tokio::spawn(async move {
            if let Err(e) = this.run_teardown(epoch).await {
                this.finish(epoch, Err(e), events::STACK_STOPPED);
                return;
            }

            let Some((token, epoch)) = this.begin_boot_phase(epoch) else {
                return;
            };
            this.inner.hub.notify(events::STACK_STARTING);
            let result = this.run_boot(token, epoch).await;
            this.finish(epoch, result, events::STACK_STARTED);
        }));
        Ok(())
    }

    /// Cancels an in-flight boot and reconciles with a full teardown.
    ///
    /// Only valid while starting. Cancellation is cooperative: services the
    /// backend already started are removed by the teardown, not rolled back.
    pub fn cancel(&self) -> Result<(), LifecycleError> {
        let (epoch, boot_task) = {
            let mut state = lock(&self.inner.state);
            if state.status != LifecycleStatus::Starting {
                return Err(LifecycleError::Conflict("stack is not starting".into()));
            }
            if let Some(token) = state.cancel.take() {
                token.cancel();
            }
            state.status = LifecycleStatus::Stopping;
            state.epoch += 1;
            (state.epoch, state.boot_task.take())
        };

        tracing::info!("Stack boot cancelled, tearing down");
        self.inner.hub.notify(events::STACK_STOPPING);

        let this = self.clone();
        tokio::spawn(async move {
            if let Some(mut handle) = boot_task
                && tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err()
            {
                tracing::warn!(
                    "Boot did not stop within {}s of cancel, aborting it",
                    CANCEL_GRACE.as_secs()
                );
                handle.abort();
            }
            let result = this.run_teardown(epoch).await;
            this.finish(epoch, result, events::STACK_STOPPED);
        });
        Ok(())
    }

    /// Passes a per-service operation through to the backend.
    pub async fn service_action(
        &self,
        service: &str,
        action: ServiceAction,
    ) -> Result<(), LifecycleError> {
        lock(&self.inner.state).ensure_idle()?;

        let backend = &self.inner.backend;
        let result = match action {
            ServiceAction::Start => backend.start_service(service).await,
            ServiceAction::Stop => backend.stop_service(service).await,
            ServiceAction::Restart => backend.restart_service(service).await,
            ServiceAction::Rebuild => backend.rebuild_service(service).await,
        };

        let error = result.as_ref().err().map(ToString::to_string);
        match &error {
            Some(e) => tracing::error!(service, action = %action, "Service action failed: {}", e),
            None => tracing::info!(service, action = %action, "Service action completed"),
        }
        self.inner.hub.broadcast(
            events::SERVICE_ACTION,
            &serde_json::json!({
                "service": service,
                "action": action,
                "error": error,
            }),
        );

        result.map_err(LifecycleError::from)
    }

    /// Current lifecycle snapshot, with running counts queried live.
    pub async fn status(&self) -> StackStatusView {
        match self.inner.backend.get_services().await {
            Ok(services) => self.status_from(&services),
            Err(e) => {
                tracing::warn!("Could not list services for status: {}", e);
                self.status_from(&[])
            }
        }
    }

    /// Lifecycle snapshot against an already fetched service list.
    pub fn status_from(&self, services: &[ServiceStatus]) -> StackStatusView {
        let (status, last_error, progress) = {
            let state = lock(&self.inner.state);
            (state.status, state.last_error.clone(), state.progress.clone())
        };
        let running = services.iter().filter(|s| s.running).count();

        let status = match status {
            LifecycleStatus::Starting => StackStatus::Starting,
            LifecycleStatus::Stopping => StackStatus::Stopping,
            LifecycleStatus::Idle if running > 0 => StackStatus::Running,
            LifecycleStatus::Idle => StackStatus::Stopped,
        };

        StackStatusView {
            status,
            running,
            total: services.len(),
            last_error,
            progress,
        }
    }

    /// Internal state, without querying the backend.
    pub fn lifecycle_status(&self) -> LifecycleStatus {
        lock(&self.inner.state).status
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.state).last_error.clone()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Moves a restart from its teardown phase into its boot phase.
    fn begin_boot_phase(&self, epoch: u64) -> Option<(CancellationToken, u64)> {
        let mut state = lock(&self.inner.state);
        if state.epoch != epoch {
            return None;
        }
        state.status = LifecycleStatus::Starting;
        state.epoch += 1;
        let token = CancellationToken::new();
        state.cancel = Some(token.clone());
        Some((token, state.epoch))
    }

    fn progress_sink(&self, epoch: u64) -> ProgressFn {
        let this = self.clone();
        Arc::new(move |event: ProgressEvent| {
            {
                let mut state = lock(&this.inner.state);
                if state.epoch != epoch {
                    return;
                }
                state.progress.push(event.clone());
            }
            tracing::debug!(phase = %event.phase, "{}", event.message);
            this.inner.hub.broadcast(events::STACK_PROGRESS, &event);
        })
    }

    async fn run_boot(&self, token: CancellationToken, epoch: u64) -> Result<(), BackendError> {
        let progress = self.progress_sink(epoch);
        self.inner.backend.up(token, progress).await
    }

    async fn run_teardown(&self, epoch: u64) -> Result<(), BackendError> {
        let progress = self.progress_sink(epoch);
        let timeout = self.inner.teardown_timeout;
        tokio::time::timeout(timeout, self.inner.backend.down(progress))
            .await
            .unwrap_or(Err(BackendError::Timeout {
                secs: timeout.as_secs(),
            }))
    }

    /// Returns to Idle and reports the outcome, unless superseded.
    fn finish(&self, epoch: u64, result: Result<(), BackendError>, success_event: &str) {
        {
            let mut state = lock(&self.inner.state);
            if state.epoch != epoch {
                tracing::debug!(epoch, "Superseded lifecycle operation finished");
                return;
            }
            state.status = LifecycleStatus::Idle;
            state.cancel = None;
            state.boot_task = None;
            if let Err(e) = &result {
                state.last_error = Some(e.to_string());
            }
        }

        match result {
            Ok(()) => {
                tracing::info!(event = success_event, "Stack operation completed");
                self.inner.hub.notify(success_event);
            }
            Err(e) => {
                tracing::error!("Stack operation failed: {}", e);
                self.inner.hub.broadcast(
                    events::STACK_ERROR,
                    &serde_json::json!({ "error": e.to_string() }),
                );
            }
        }
    }
}
