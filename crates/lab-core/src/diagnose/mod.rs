//! AI-assisted diagnosis sessions.
//!
//! A session wraps one provider conversation about one service. Turns run on
//! detached tasks and report through the stack's [`EventHub`]:
//! `diagnose_started`, one `diagnose_stream` per chunk, then exactly one of
//! `diagnose_result`, `diagnose_error` or `diagnose_interrupted`.
//!
//! Each session serializes its own turns behind a turn lock; turns of
//! different sessions run concurrently.

mod prompt;
mod tools;
mod turn;

pub use prompt::initial_prompt;
pub use tools::{COMMAND_SUMMARY_CHARS, summarize_tool};
pub use turn::{
    EMPTY_RESPONSE, RAW_TAIL_CHARS, TurnNormalizer, TurnOutcome, classify_outcome,
    resolve_final_text,
};

use crate::hub::{EventHub, events};
use crate::lock;
use crate::logs::LogHistory;
use crate::text::is_blank;
use chrono::{DateTime, Utc};
use lab_proto::{AiEngine, AiSession, StreamChunk, TurnError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default bound on provider session startup.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of log lines included in the first prompt.
pub const DEFAULT_PROMPT_LOG_LINES: usize = 50;

/// Errors returned by diagnosis operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiagnoseError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider '{0}' is not available")]
    Unavailable(String),

    #[error("provider session did not start within {0}s")]
    StartTimeout(u64),

    #[error(transparent)]
    Provider(#[from] TurnError),
}

/// Identifiers of a launched turn, returned before the turn finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedTurn {
    pub session_id: String,
    pub request_id: String,
    pub provider: String,
}

/// Public view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub service: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub turns: u64,
    pub busy: bool,
}

/// Settings applied to every session of a manager.
#[derive(Debug, Clone)]
pub struct DiagnoseSettings {
    pub startup_timeout: Duration,
    pub prompt_log_lines: usize,
}

impl Default for DiagnoseSettings {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            prompt_log_lines: DEFAULT_PROMPT_LOG_LINES,
        }
    }
}

/// Interrupt bookkeeping shared by a session's turns.
#[derive(Default)]
struct TurnControl {
    /// Turns launched and not yet finished, queued ones included
    pending: usize,
    interrupted: bool,
    /// Interrupt token of the turn currently holding the turn lock
    current: CancellationToken,
}

/// One diagnosis conversation.
pub struct DiagnoseSession {
    pub id: String,
    pub service: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    backend: Box<dyn AiSession>,
    turn_lock: tokio::sync::Mutex<()>,
    control: Mutex<TurnControl>,
    closed: AtomicBool,
    turns: AtomicU64,
}

impl DiagnoseSession {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            service: self.service.clone(),
            provider: self.provider.clone(),
            created_at: self.created_at,
            turns: self.turns.load(Ordering::SeqCst),
            busy: self.turn_lock.try_lock().is_err(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        lock(&self.control).interrupted
    }

    /// Hands the turn that just took the turn lock a fresh interrupt token.
    /// Returns `None` when an interrupt already landed for it.
    fn arm_turn(&self) -> Option<CancellationToken> {
        let mut control = lock(&self.control);
        if control.interrupted {
            return None;
        }
        control.current = CancellationToken::new();
        Some(control.current.clone())
    }

    /// Retires a finished turn and reports whether it was interrupted.
    fn end_turn(&self) -> bool {
        let mut control = lock(&self.control);
        control.pending = control.pending.saturating_sub(1);
        std::mem::take(&mut control.interrupted)
    }
}

/// Identifiers attached to every event of one turn.
#[derive(Clone)]
struct TurnContext {
    session_id: String,
    request_id: String,
    service: String,
    provider: String,
}

impl TurnContext {
    fn payload(&self, extra: Value) -> Value {
        let mut payload = json!({
            "sessionId": self.session_id,
            "requestId": self.request_id,
            "service": self.service,
            "provider": self.provider,
        });
        if let (Some(map), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            map.extend(extra);
        }
        payload
    }
}

struct ManagerInner {
    engines: Vec<Arc<dyn AiEngine>>,
    hub: EventHub,
    history: Arc<LogHistory>,
    sessions: Mutex<HashMap<String, Arc<DiagnoseSession>>>,
    settings: DiagnoseSettings,
}

/// Registry of the diagnosis sessions of one stack.
#[derive(Clone)]
pub struct DiagnoseManager {
    inner: Arc<ManagerInner>,
}

impl DiagnoseManager {
    /// Creates a manager. The first engine is the default provider.
    pub fn new(
        engines: Vec<Arc<dyn AiEngine>>,
        hub: EventHub,
        history: Arc<LogHistory>,
        settings: DiagnoseSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                engines,
                hub,
                history,
                sessions: Mutex::new(HashMap::new()),
                settings,
            }),
        }
    }

    /// Identifiers of the registered providers.
    pub fn providers(&self) -> Vec<String> {
        self.inner.engines.iter().map(|e| e.id().to_string()).collect()
    }

    /// Opens a session about `service` and launches its first turn.
    pub async fn start(
        &self,
        service: &str,
        provider: Option<&str>,
    ) -> Result<StartedTurn, DiagnoseError> {
        if is_blank(service) {
            return Err(DiagnoseError::InvalidInput("service is required".into()));
        }
        let engine = self.engine(provider)?;
        if !engine.is_available().await {
            return Err(DiagnoseError::Unavailable(engine.id().to_string()));
        }

        // Startup runs on its own task so a dropped request cannot abort it
        // halfway through provider setup.
        let timeout = self.inner.settings.startup_timeout;
        let starter = Arc::clone(&engine);
        let startup =
            tokio::spawn(async move { tokio::time::timeout(timeout, starter.start_session()).await });
        let backend = match startup.await {
            Ok(Ok(Ok(session))) => session,
            Ok(Ok(Err(e))) => return Err(DiagnoseError::Provider(e)),
            Ok(Err(_)) => return Err(DiagnoseError::StartTimeout(timeout.as_secs())),
            Err(e) => return Err(DiagnoseError::Provider(TurnError::Provider(e.to_string()))),
        };

        let session = Arc::new(DiagnoseSession {
            id: Uuid::new_v4().to_string(),
            service: service.to_string(),
            provider: engine.id().to_string(),
            created_at: Utc::now(),
            backend,
            turn_lock: tokio::sync::Mutex::new(()),
            control: Mutex::new(TurnControl::default()),
            closed: AtomicBool::new(false),
            turns: AtomicU64::new(0),
        });
        lock(&self.inner.sessions).insert(session.id.clone(), Arc::clone(&session));
        tracing::info!(
            session = %session.id,
            service,
            provider = %session.provider,
            provider_session = session.backend.provider_session_id(),
            "Diagnosis session started"
        );

        let recent = self
            .inner
            .history
            .for_service(service, Some(self.inner.settings.prompt_log_lines));
        let prompt = initial_prompt(service, &recent);
        Ok(self.launch_turn(session, prompt))
    }

    /// Sends a follow-up prompt; queued behind any turn in flight.
    pub fn message(&self, session_id: &str, prompt: &str) -> Result<StartedTurn, DiagnoseError> {
        if is_blank(prompt) {
            return Err(DiagnoseError::InvalidInput("message is required".into()));
        }
        let session = self.session(session_id)?;
        Ok(self.launch_turn(session, prompt.to_string()))
    }

    /// Flags the session interrupted and cancels the turn in flight. A turn
    /// still queued behind the turn lock is skipped. No-op when the session
    /// has no turn pending.
    pub fn interrupt(&self, session_id: &str) -> Result<(), DiagnoseError> {
        let session = self.session(session_id)?;
        let mut control = lock(&session.control);
        if control.pending == 0 {
            tracing::debug!(session = %session.id, "No diagnosis turn to interrupt");
            return Ok(());
        }
        control.interrupted = true;
        control.current.cancel();
        tracing::info!(session = %session.id, "Interrupting diagnosis turn");
        Ok(())
    }

    /// Removes the session and releases its provider session.
    pub async fn close(&self, session_id: &str) -> Result<(), DiagnoseError> {
        if is_blank(session_id) {
            return Err(DiagnoseError::InvalidInput("session id is required".into()));
        }
        let session = lock(&self.inner.sessions)
            .remove(session_id)
            .ok_or_else(|| DiagnoseError::SessionNotFound(session_id.to_string()))?;
        self.release(&session).await
    }

    /// Closes every session. Release failures are logged.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<DiagnoseSession>> =
            lock(&self.inner.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = self.release(&session).await {
                tracing::warn!(session = %session.id, "Failed to close provider session: {}", e);
            }
        }
    }

    /// One-shot question outside any session.
    pub async fn ask(&self, provider: Option<&str>, prompt: &str) -> Result<String, DiagnoseError> {
        if is_blank(prompt) {
            return Err(DiagnoseError::InvalidInput("prompt is required".into()));
        }
        let engine = self.engine(provider)?;
        if !engine.is_available().await {
            return Err(DiagnoseError::Unavailable(engine.id().to_string()));
        }
        Ok(engine.ask(prompt).await?)
    }

    /// Live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = lock(&self.inner.sessions)
            .values()
            .map(|s| s.info())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    fn engine(&self, provider: Option<&str>) -> Result<Arc<dyn AiEngine>, DiagnoseError> {
        let found = match provider.filter(|p| !is_blank(p)) {
            Some(id) => self.inner.engines.iter().find(|e| e.id() == id),
            None => self.inner.engines.first(),
        };
        found
            .cloned()
            .ok_or_else(|| DiagnoseError::UnknownProvider(provider.unwrap_or("default").to_string()))
    }

    fn session(&self, session_id: &str) -> Result<Arc<DiagnoseSession>, DiagnoseError> {
        if is_blank(session_id) {
            return Err(DiagnoseError::InvalidInput("session id is required".into()));
        }
        lock(&self.inner.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| DiagnoseError::SessionNotFound(session_id.to_string()))
    }

    async fn release(&self, session: &DiagnoseSession) -> Result<(), DiagnoseError> {
        session.closed.store(true, Ordering::SeqCst);
        lock(&session.control).current.cancel();
        let result = session.backend.close().await;
        tracing::info!(session = %session.id, "Diagnosis session closed");
        self.inner.hub.broadcast(
            events::DIAGNOSE_SESSION_CLOSED,
            &json!({
                "sessionId": session.id,
                "service": session.service,
                "provider": session.provider,
            }),
        );
        result.map_err(DiagnoseError::from)
    }

    fn launch_turn(&self, session: Arc<DiagnoseSession>, prompt: String) -> StartedTurn {
        let ctx = TurnContext {
            session_id: session.id.clone(),
            request_id: Uuid::new_v4().to_string(),
            service: session.service.clone(),
            provider: session.provider.clone(),
        };
        let started = StartedTurn {
            session_id: ctx.session_id.clone(),
            request_id: ctx.request_id.clone(),
            provider: ctx.provider.clone(),
        };

        // Counted before the 202 goes out, so an interrupt right after
        // `message` still reaches this turn
        lock(&session.control).pending += 1;

        let hub = self.inner.hub.clone();
        tokio::spawn(async move {
            let _turn = session.turn_lock.lock().await;
            if session.closed.load(Ordering::SeqCst) {
                tracing::debug!(request = %ctx.request_id, "Session closed before turn ran");
                session.end_turn();
                return;
            }
            session.turns.fetch_add(1, Ordering::SeqCst);

            hub.broadcast(events::DIAGNOSE_STARTED, &ctx.payload(json!({})));

            let result = match session.arm_turn() {
                Some(interrupt) => {
                    let on_chunk = |chunk: StreamChunk| {
                        hub.broadcast(
                            events::DIAGNOSE_STREAM,
                            &ctx.payload(json!({ "chunk": chunk })),
                        );
                    };
                    session.backend.ask_stream(&prompt, interrupt, &on_chunk).await
                }
                None => {
                    tracing::debug!(request = %ctx.request_id, "Turn interrupted before it ran");
                    Err(TurnError::Cancelled)
                }
            };
            let interrupted = session.end_turn();

            match classify_outcome(result, interrupted) {
                TurnOutcome::Completed(text) => {
                    tracing::info!(request = %ctx.request_id, chars = text.len(), "Diagnosis turn completed");
                    hub.broadcast(events::DIAGNOSE_RESULT, &ctx.payload(json!({ "text": text })));
                }
                TurnOutcome::Interrupted(text) => {
                    tracing::info!(request = %ctx.request_id, "Diagnosis turn interrupted");
                    hub.broadcast(
                        events::DIAGNOSE_INTERRUPTED,
                        &ctx.payload(json!({ "text": text })),
                    );
                }
                TurnOutcome::Failed(error) => {
                    tracing::error!(request = %ctx.request_id, "Diagnosis turn failed: {}", error);
                    hub.broadcast(
                        events::DIAGNOSE_ERROR,
                        &ctx.payload(json!({
                            "error": error.to_string(),
                            "cancelled": error.is_cancellation(),
                            "debug": error.debug(),
                        })),
                    );
                }
            }
        });

        started
    }
}
