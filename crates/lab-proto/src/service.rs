//! Service, log and health data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Status of one service as reported by the orchestration backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Service name (unique within a stack)
    pub name: String,
    /// Whether the service is currently running
    pub running: bool,
    /// Backend-specific state string (e.g. "running", "exited (1)")
    #[serde(default)]
    pub state: String,
    /// Primary port the service listens on, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// HTTP health endpoint, if the service exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
}

impl ServiceStatus {
    /// A running service with no port or health endpoint.
    pub fn running(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: true,
            state: "running".to_string(),
            port: None,
            health_url: None,
        }
    }

    /// A stopped service.
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: false,
            state: "exited".to_string(),
            port: None,
            health_url: None,
        }
    }
}

/// Where a service's output can be tailed from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogSource {
    /// A log file written by a host process.
    File { path: PathBuf },
    /// A container whose stdout/stderr are read through the container runtime.
    Container { id: String },
}

/// One phase/message pair emitted during a lifecycle operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    pub phase: String,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            message: message.into(),
        }
    }
}

/// Severity of a parsed log line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Normalizes a free-form level name (`warning`, `ERR`, `fatal`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" | "DEBUG" | "DBG" => Some(Self::Debug),
            "INFO" | "INF" | "NOTICE" => Some(Self::Info),
            "WARN" | "WARNING" | "WRN" => Some(Self::Warn),
            "ERROR" | "ERR" | "FATAL" | "CRITICAL" | "CRIT" | "PANIC" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed unit of service output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Parsed message with escape sequences stripped
    pub message: String,
    /// The untouched original line
    pub raw: String,
}

/// Health classification of one service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// Latest health of one service, recomputed every monitor cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse_aliases() {
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("ERR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse(" fatal "), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("trace"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_log_level_serializes_uppercase() {
        let json = serde_json::to_string(&LogLevel::Warn).unwrap();
        assert_eq!(json, "\"WARN\"");
    }

    #[test]
    fn test_log_source_tagged() {
        let source = LogSource::Container {
            id: "abc123".to_string(),
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["type"], "container");
        assert_eq!(json["id"], "abc123");
    }

    #[test]
    fn test_service_status_skips_empty_optionals() {
        let json = serde_json::to_string(&ServiceStatus::running("api")).unwrap();
        assert!(!json.contains("port"));
        assert!(!json.contains("health_url"));
    }
}
