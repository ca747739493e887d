//! Orchestration backend abstraction.
//!
//! The [`Backend`] trait is the narrow interface through which the control
//! plane asks an external orchestrator to boot, tear down and inspect the
//! services of a stack. The control plane never starts processes itself.

use crate::service::{LogSource, ProgressEvent, ServiceStatus};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Callback invoked by the backend for every progress step of `up`/`down`.
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A progress callback that discards everything.
pub fn noop_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Errors reported by an orchestration backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The operation observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation did not finish in time.
    #[error("operation timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The named service does not exist in the stack.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// An external command failed.
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// The external orchestration collaborator for one stack.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Current status of every service in the stack.
    async fn get_services(&self) -> Result<Vec<ServiceStatus>, BackendError>;

    /// Boots the stack. Must observe `cancel` cooperatively; resources already
    /// started when cancellation is observed are left for a later `down`.
    async fn up(&self, cancel: CancellationToken, progress: ProgressFn) -> Result<(), BackendError>;

    /// Tears the stack down.
    async fn down(&self, progress: ProgressFn) -> Result<(), BackendError>;

    async fn start_service(&self, name: &str) -> Result<(), BackendError>;

    async fn stop_service(&self, name: &str) -> Result<(), BackendError>;

    async fn restart_service(&self, name: &str) -> Result<(), BackendError>;

    /// Rebuilds the service image/binary and restarts it.
    async fn rebuild_service(&self, name: &str) -> Result<(), BackendError>;

    /// Where the named service's output can be tailed from.
    async fn log_source(&self, name: &str) -> Result<LogSource, BackendError>;
}
