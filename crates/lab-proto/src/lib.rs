//! # lab-proto
//!
//! Shared types, error definitions, and traits for the lab control plane.
//!
//! This crate provides the foundational abstractions used across all lab
//! crates, including:
//! - The service/log/health data model pushed to dashboard clients
//! - The orchestration collaborator trait ([`Backend`])
//! - The AI collaborator traits ([`AiEngine`], [`AiSession`]) and the
//!   normalized provider event and chunk types a diagnosis turn speaks

mod backend;
mod provider;
mod service;

pub use backend::{Backend, BackendError, ProgressFn, noop_progress};
pub use provider::{
    AiEngine, AiSession, ChunkFn, ChunkKind, ProviderEvent, StreamChunk, TurnDebug, TurnError,
};
pub use service::{
    HealthStatus, LogLevel, LogLine, LogSource, ProgressEvent, ServiceHealth, ServiceStatus,
};
