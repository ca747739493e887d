//! Stack context: one addressable unit per managed stack.
//!
//! Composes the hub, lifecycle controller, log pipeline, health monitor and
//! diagnosis manager of a stack, owns its log history, and runs the
//! background forwarders plus the periodic reconcile loop. Components only
//! talk to each other through hub broadcasts and read-only queries.

use crate::config::{LabConfig, StackConfig};
use crate::diagnose::{DiagnoseError, DiagnoseManager, DiagnoseSettings, StartedTurn};
use crate::health::{DEFAULT_HEALTH_INTERVAL, DEFAULT_PROBE_TIMEOUT, HealthMonitor, HealthSnapshot};
use crate::hub::{EventHub, events};
use crate::lifecycle::{DEFAULT_TEARDOWN_TIMEOUT, StackController};
use crate::lock;
use crate::logs::{DEFAULT_HISTORY_CAPACITY, DEFAULT_TAIL_BACKLOG, LogHistory, LogPipeline};
use crate::text::is_blank;
use lab_proto::{AiEngine, Backend, BackendError, LogLine, ServiceStatus};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default interval of the reconcile loop.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Tunables of one stack context.
#[derive(Debug, Clone)]
pub struct StackSettings {
    pub runtime: String,
    pub history_capacity: usize,
    pub tail_backlog: usize,
    pub reconcile_interval: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub teardown_timeout: Duration,
    pub diagnose: DiagnoseSettings,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            tail_backlog: DEFAULT_TAIL_BACKLOG,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            diagnose: DiagnoseSettings::default(),
        }
    }
}

impl StackSettings {
    pub fn from_config(config: &LabConfig, stack: &StackConfig) -> Self {
        Self {
            runtime: stack.runtime.clone(),
            history_capacity: config.logs.history_capacity,
            tail_backlog: config.logs.tail_backlog,
            reconcile_interval: config.logs.reconcile_interval(),
            health_interval: config.health.interval(),
            probe_timeout: config.health.probe_timeout(),
            teardown_timeout: config.lifecycle.teardown_timeout(),
            diagnose: DiagnoseSettings {
                startup_timeout: config.diagnose.startup_timeout(),
                prompt_log_lines: config.diagnose.prompt_log_lines,
            },
        }
    }
}

type Receivers = (mpsc::Receiver<LogLine>, mpsc::Receiver<HealthSnapshot>);

struct StackInner {
    name: String,
    backend: Arc<dyn Backend>,
    hub: EventHub,
    controller: StackController,
    logs: LogPipeline,
    health: HealthMonitor,
    diagnose: DiagnoseManager,
    history: Arc<LogHistory>,
    reconcile_interval: Duration,
    receivers: Mutex<Option<Receivers>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Everything the control plane runs for one stack.
#[derive(Clone)]
pub struct StackContext {
    inner: Arc<StackInner>,
}

impl StackContext {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        engines: Vec<Arc<dyn AiEngine>>,
        settings: StackSettings,
    ) -> Self {
        let hub = EventHub::new();
        let history = Arc::new(LogHistory::new(settings.history_capacity));
        let controller = StackController::with_teardown_timeout(
            Arc::clone(&backend),
            hub.clone(),
            settings.teardown_timeout,
        );
        let (logs, log_rx) = LogPipeline::new(settings.runtime, settings.tail_backlog);
        let (health, health_rx) = HealthMonitor::new(
            Arc::clone(&backend),
            settings.health_interval,
            settings.probe_timeout,
        );
        let diagnose =
            DiagnoseManager::new(engines, hub.clone(), Arc::clone(&history), settings.diagnose);

        Self {
            inner: Arc::new(StackInner {
                name: name.into(),
                backend,
                hub,
                controller,
                logs,
                health,
                diagnose,
                history,
                reconcile_interval: settings.reconcile_interval,
                receivers: Mutex::new(Some((log_rx, health_rx))),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    pub fn controller(&self) -> &StackController {
        &self.inner.controller
    }

    pub fn logs(&self) -> &LogPipeline {
        &self.inner.logs
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    pub fn diagnose(&self) -> &DiagnoseManager {
        &self.inner.diagnose
    }

    pub fn history(&self) -> &LogHistory {
        &self.inner.history
    }

    /// Spawns the forwarders, the reconcile loop and the health monitor.
    /// Returns `false` if already started.
    pub fn start(&self) -> bool {
        let Some((log_rx, health_rx)) = lock(&self.inner.receivers).take() else {
            return false;
        };

        let tasks = vec![
            self.spawn_log_forwarder(log_rx),
            self.spawn_health_forwarder(health_rx),
            self.spawn_reconcile_loop(),
        ];
        lock(&self.inner.tasks).extend(tasks);
        self.inner.health.start();

        tracing::info!(stack = %self.inner.name, "Stack context started");
        true
    }

    /// Stops tails, health probes and sessions, then closes every subscriber.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.logs.stop_all();
        self.inner.health.stop();
        self.inner.diagnose.close_all().await;
        self.inner.hub.stop();

        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!(stack = %self.inner.name, "Stack context shut down");
    }

    pub async fn services(&self) -> Result<Vec<ServiceStatus>, BackendError> {
        self.inner.backend.get_services().await
    }

    /// One reconcile cycle: align log tails with the running services and
    /// broadcast the `services` and `stack_status` snapshots.
    pub async fn reconcile_once(&self) {
        let services = match self.inner.backend.get_services().await {
            Ok(services) => services,
            Err(e) => {
                tracing::warn!(stack = %self.inner.name, "Reconcile skipped: {}", e);
                return;
            }
        };

        self.inner
            .logs
            .reconcile(self.inner.backend.as_ref(), &services)
            .await;
        self.inner.hub.broadcast(events::SERVICES, &services);
        let status = self.inner.controller.status_from(&services);
        self.inner.hub.broadcast(events::STACK_STATUS, &status);
    }

    /// Starts a diagnosis session about one of this stack's services.
    pub async fn start_diagnosis(
        &self,
        service: &str,
        provider: Option<&str>,
    ) -> Result<StartedTurn, DiagnoseError> {
        if is_blank(service) {
            return Err(DiagnoseError::InvalidInput("service is required".into()));
        }
        match self.inner.backend.get_services().await {
            Ok(services) if !services.iter().any(|s| s.name == service) => {
                return Err(DiagnoseError::ServiceNotFound(service.to_string()));
            }
            Ok(_) => {}
            // Diagnosing a stack whose orchestrator is down is still useful
            Err(e) => tracing::warn!(service, "Could not verify service: {}", e),
        }
        self.inner.diagnose.start(service, provider).await
    }

    /// Recent log lines, optionally for one service only.
    pub fn log_history(&self, service: Option<&str>, limit: Option<usize>) -> Vec<LogLine> {
        match service.filter(|s| !is_blank(s)) {
            Some(service) => self.inner.history.for_service(service, limit),
            None => self.inner.history.snapshot(limit),
        }
    }

    fn spawn_log_forwarder(&self, mut rx: mpsc::Receiver<LogLine>) -> JoinHandle<()> {
        let hub = self.inner.hub.clone();
        let history = Arc::clone(&self.inner.history);
        let cancel = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    line = rx.recv() => line,
                };
                let Some(line) = line else { break };
                history.push(line.clone());
                hub.broadcast(events::LOG, &line);
            }
        })
    }

    fn spawn_health_forwarder(&self, mut rx: mpsc::Receiver<HealthSnapshot>) -> JoinHandle<()> {
        let hub = self.inner.hub.clone();
        let cancel = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    snapshot = rx.recv() => snapshot,
                };
                let Some(snapshot) = snapshot else { break };
                hub.broadcast(events::HEALTH, &snapshot);
            }
        })
    }

    fn spawn_reconcile_loop(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.reconcile_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = this.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => this.reconcile_once().await,
                }
            }
        })
    }
}

/// Stack contexts by name.
#[derive(Default)]
pub struct StackRegistry {
    stacks: BTreeMap<String, StackContext>,
}

impl StackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stack, replacing any stack of the same name.
    pub fn insert(&mut self, stack: StackContext) {
        self.stacks.insert(stack.name().to_string(), stack);
    }

    pub fn get(&self, name: &str) -> Option<&StackContext> {
        self.stacks.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.stacks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn start_all(&self) {
        for stack in self.stacks.values() {
            stack.start();
        }
    }

    pub async fn shutdown_all(&self) {
        for stack in self.stacks.values() {
            stack.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::PushEvent;
    use crate::lifecycle::{LifecycleStatus, StackStatus};
    use crate::testing::{MockAiEngine, MockBackend, ScriptedTurn};
    use lab_proto::LogSource;

    fn settings() -> StackSettings {
        StackSettings {
            reconcile_interval: Duration::from_millis(20),
            health_interval: Duration::from_millis(20),
            ..StackSettings::default()
        }
    }

    fn context(backend: &MockBackend, engine: &MockAiEngine) -> StackContext {
        StackContext::new(
            "shop",
            Arc::new(backend.clone()),
            vec![Arc::new(engine.clone())],
            settings(),
        )
    }

    async fn next_named(client: &mut crate::hub::PushClient, name: &str) -> PushEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = client.recv().await.expect("hub closed");
                if event.name == name {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {name} event"))
    }

    #[tokio::test]
    async fn test_boot_end_to_end() {
        let backend = MockBackend::with_stopped(&["api", "db"]);
        let stack = context(&backend, &MockAiEngine::new("mock", vec![]));
        let mut client = stack.hub().register();

        assert_eq!(stack.controller().status().await.status, StackStatus::Stopped);
        stack.controller().up().await.unwrap();
        assert_eq!(stack.controller().lifecycle_status(), LifecycleStatus::Starting);

        next_named(&mut client, "stack_started").await;
        assert_eq!(stack.controller().lifecycle_status(), LifecycleStatus::Idle);

        let view = stack.controller().status().await;
        assert_eq!(view.status, StackStatus::Running);
        assert_eq!(view.running, view.total);
        assert_eq!(view.total, 2);
    }

    #[tokio::test]
    async fn test_reconcile_broadcasts_snapshots_and_tails() {
        let backend = MockBackend::with_stopped(&["api", "db"]);
        backend.set_running("api", true);
        let stack = context(&backend, &MockAiEngine::new("mock", vec![]));
        let mut client = stack.hub().register();

        stack.reconcile_once().await;

        let services = next_named(&mut client, "services").await;
        assert_eq!(services.data.as_array().unwrap().len(), 2);
        let status = next_named(&mut client, "stack_status").await;
        assert_eq!(status.data["status"], "running");
        assert_eq!(status.data["running"], 1);
        assert_eq!(stack.logs().active_services(), vec!["api"]);
        stack.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_wires_forwarders() {
        let backend = MockBackend::with_stopped(&["worker"]);
        backend.set_running("worker", true);
        let stack = context(&backend, &MockAiEngine::new("mock", vec![]));
        let mut client = stack.hub().register();

        assert!(stack.start());
        assert!(!stack.start());

        let health = next_named(&mut client, "health").await;
        assert_eq!(health.data["worker"]["status"], "unknown");
        next_named(&mut client, "stack_status").await;

        stack.shutdown().await;
        assert!(stack.logs().active_services().is_empty());
        assert!(stack.hub().is_stopped());
        assert!(client.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_log_lines_reach_history_and_hub() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.log");
        std::fs::write(&path, "[ERROR][2024-01-01T00:00:00Z] boom\n").unwrap();

        if std::process::Command::new("tail")
            .args(["-n", "0", "/dev/null"])
            .output()
            .map_or(true, |o| !o.status.success())
        {
            eprintln!("Skipping test: tail not available");
            return;
        }

        let backend = MockBackend::with_stopped(&["api"]);
        backend.set_running("api", true);
        backend.set_log_source("api", LogSource::File { path });
        let stack = context(&backend, &MockAiEngine::new("mock", vec![]));
        let mut client = stack.hub().register();
        stack.start();

        let log = next_named(&mut client, "log").await;
        assert_eq!(log.data["message"], "boom");
        assert_eq!(log.data["level"], "ERROR");

        let history = stack.log_history(Some("api"), None);
        assert_eq!(history.len(), 1);
        assert!(stack.log_history(Some("db"), None).is_empty());
        stack.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_diagnosis_validates_service() {
        let backend = MockBackend::with_stopped(&["api"]);
        let engine = MockAiEngine::new("mock", vec![ScriptedTurn::answer("fine")]);
        let stack = context(&backend, &engine);

        assert_eq!(
            stack.start_diagnosis("ghost", None).await,
            Err(DiagnoseError::ServiceNotFound("ghost".into()))
        );
        assert!(matches!(
            stack.start_diagnosis("", None).await,
            Err(DiagnoseError::InvalidInput(_))
        ));

        let started = stack.start_diagnosis("api", None).await.unwrap();
        assert_eq!(started.provider, "mock");
        assert_eq!(stack.diagnose().session_count(), 1);

        stack.shutdown().await;
        assert_eq!(stack.diagnose().session_count(), 0);
    }

    #[test]
    fn test_registry() {
        let mut registry = StackRegistry::new();
        for name in ["b", "a"] {
            registry.insert(StackContext::new(
                name,
                Arc::new(MockBackend::with_stopped(&[])),
                vec![],
                StackSettings::default(),
            ));
        }
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_settings_from_config() {
        let config = LabConfig::parse_yaml(
            "stacks:\n  - name: shop\n    runtime: podman\nlogs:\n  history_capacity: 42\n",
        )
        .unwrap();
        let settings = StackSettings::from_config(&config, &config.stacks[0]);
        assert_eq!(settings.runtime, "podman");
        assert_eq!(settings.history_capacity, 42);
        assert_eq!(settings.reconcile_interval, Duration::from_secs(2));
    }
}
