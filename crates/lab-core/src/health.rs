//! Periodic health monitor.
//!
//! Every cycle probes each running service: its HTTP health endpoint when it
//! has one, otherwise a bare TCP connect to its primary port. Services that
//! are not running are reported `unknown` without being probed.
//!
//! Each cycle's full snapshot is published through a capacity-1 channel with
//! `try_send`, so a consumer that falls behind only ever misses stale
//! snapshots.

use crate::lock;
use futures::future::join_all;
use lab_proto::{Backend, HealthStatus, ServiceHealth, ServiceStatus};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default interval between health cycles.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Health of every service of a stack, keyed by service name.
pub type HealthSnapshot = BTreeMap<String, ServiceHealth>;

#[derive(Debug, PartialEq, Eq)]
enum Probe {
    Healthy,
    Unhealthy(String),
    Unknown,
}

struct MonitorInner {
    backend: Arc<dyn Backend>,
    client: reqwest::Client,
    interval: Duration,
    probe_timeout: Duration,
    latest: Mutex<HealthSnapshot>,
    sink: mpsc::Sender<HealthSnapshot>,
    running: Mutex<Option<CancellationToken>>,
}

/// Health monitor for one stack.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    /// Creates a monitor and the receiver its snapshots are published on.
    pub fn new(
        backend: Arc<dyn Backend>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> (Self, mpsc::Receiver<HealthSnapshot>) {
        let (sink, rx) = mpsc::channel(1);
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                backend,
                client: reqwest::Client::new(),
                interval,
                probe_timeout,
                latest: Mutex::new(HealthSnapshot::new()),
                sink,
                running: Mutex::new(None),
            }),
        };
        (monitor, rx)
    }

    /// Starts the periodic loop. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let cancel = {
            let mut running = lock(&self.inner.running);
            if running.is_some() {
                return false;
            }
            let cancel = CancellationToken::new();
            *running = Some(cancel.clone());
            cancel
        };

        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // A cycle in flight is abandoned on stop
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = this.check_once() => {}
                }
            }
            tracing::debug!("Health monitor stopped");
        });
        tracing::info!(interval_secs = self.inner.interval.as_secs(), "Health monitor started");
        true
    }

    pub fn stop(&self) {
        if let Some(cancel) = lock(&self.inner.running).take() {
            cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> HealthSnapshot {
        lock(&self.inner.latest).clone()
    }

    /// Runs one health cycle, stores and publishes its snapshot.
    pub async fn check_once(&self) -> HealthSnapshot {
        let services = match self.inner.backend.get_services().await {
            Ok(services) => services,
            Err(e) => {
                tracing::warn!("Health cycle skipped, could not list services: {}", e);
                return self.snapshot();
            }
        };

        let outcomes = join_all(services.iter().map(|s| self.probe(s))).await;
        let previous = self.snapshot();
        let now = chrono::Utc::now();

        let snapshot: HealthSnapshot = services
            .iter()
            .zip(outcomes)
            .map(|(service, outcome)| {
                let failures = previous
                    .get(&service.name)
                    .map_or(0, |h| h.consecutive_failures);
                let health = match outcome {
                    Probe::Healthy => ServiceHealth {
                        status: HealthStatus::Healthy,
                        last_check: now,
                        last_error: None,
                        consecutive_failures: 0,
                    },
                    Probe::Unhealthy(error) => {
                        tracing::debug!(service = %service.name, "Health probe failed: {}", error);
                        ServiceHealth {
                            status: HealthStatus::Unhealthy,
                            last_check: now,
                            last_error: Some(error),
                            consecutive_failures: failures.saturating_add(1),
                        }
                    }
                    Probe::Unknown => ServiceHealth {
                        status: HealthStatus::Unknown,
                        last_check: now,
                        last_error: None,
                        consecutive_failures: failures,
                    },
                };
                (service.name.clone(), health)
            })
            .collect();

        *lock(&self.inner.latest) = snapshot.clone();

        match self.inner.sink.try_send(snapshot.clone()) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Health consumer behind, dropping snapshot");
            }
        }
        snapshot
    }

    async fn probe(&self, service: &ServiceStatus) -> Probe {
        if !service.running {
            return Probe::Unknown;
        }
        if let Some(url) = &service.health_url {
            return self.probe_http(url).await;
        }
        if let Some(port) = service.port {
            return self.probe_tcp(port).await;
        }
        Probe::Unknown
    }

    async fn probe_http(&self, url: &str) -> Probe {
        let request = self.inner.client.get(url).timeout(self.inner.probe_timeout);
        match request.send().await {
            Ok(response) if response.status().is_success() => Probe::Healthy,
            Ok(response) => Probe::Unhealthy(format!("HTTP {}", response.status())),
            Err(e) if e.is_timeout() => Probe::Unhealthy(format!(
                "timed out after {}s",
                self.inner.probe_timeout.as_secs()
            )),
            Err(e) => Probe::Unhealthy(e.to_string()),
        }
    }

    async fn probe_tcp(&self, port: u16) -> Probe {
        let connect = TcpStream::connect(("127.0.0.1", port));
        match tokio::time::timeout(self.inner.probe_timeout, connect).await {
            Ok(Ok(_)) => Probe::Healthy,
            Ok(Err(e)) => Probe::Unhealthy(format!("port {port}: {e}")),
            Err(_) => Probe::Unhealthy(format!(
                "port {port}: connect timed out after {}s",
                self.inner.probe_timeout.as_secs()
            )),
        }
    }
}
