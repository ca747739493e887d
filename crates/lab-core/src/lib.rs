//! # lab-core
//!
//! Control plane for the lab dashboard.
//!
//! This crate provides:
//! - A push-event hub fanning named events out to dashboard subscribers
//! - The stack lifecycle state machine (up/down/restart/cancel)
//! - Per-service log tailing, parsing and a bounded history buffer
//! - A periodic health monitor
//! - AI diagnosis sessions and the turn normalization state machine
//! - Per-stack composition of all of the above, plus configuration loading

pub mod config;
pub mod diagnose;
pub mod health;
pub mod hub;
pub mod lifecycle;
pub mod logs;
pub mod stack;
pub mod testing;
mod text;

pub use config::{
    ConfigError, DiagnoseConfig, HealthConfig, LabConfig, LifecycleConfig, LogsConfig,
    ServerConfig, ServiceOverride, StackConfig,
};
pub use diagnose::{DiagnoseError, DiagnoseManager, DiagnoseSettings, SessionInfo, StartedTurn};
pub use health::{HealthMonitor, HealthSnapshot};
pub use hub::{ClientId, EventHub, HubFrame, PushClient, PushEvent, events};
pub use lifecycle::{
    LifecycleError, LifecycleStatus, ServiceAction, StackController, StackStatus, StackStatusView,
};
pub use logs::{LogHistory, LogPipeline, parse_line};
pub use stack::{StackContext, StackRegistry, StackSettings};
pub use text::{is_blank, tail_chars, truncate_with_ellipsis};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Critical sections in this crate only touch plain data, so a poisoned
/// lock still guards a consistent value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
