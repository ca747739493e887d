//! Scripted AI engine for deterministic diagnosis tests.
//!
//! Sessions replay [`ScriptedTurn`]s through the real [`TurnNormalizer`], so
//! tests exercise the same chunking and resolution as a live provider.

use crate::diagnose::TurnNormalizer;
use crate::lock;
use async_trait::async_trait;
use lab_proto::{AiEngine, AiSession, ChunkFn, ProviderEvent, TurnError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub events: Vec<ProviderEvent>,
    /// How the provider stream ends
    pub end: Result<(), TurnError>,
    /// Block after the events until the session is interrupted
    pub wait_for_interrupt: bool,
    /// Delay before the stream ends
    pub delay: Option<Duration>,
}

impl ScriptedTurn {
    pub fn new(events: Vec<ProviderEvent>) -> Self {
        Self {
            events,
            end: Ok(()),
            wait_for_interrupt: false,
            delay: None,
        }
    }

    /// A turn streaming `text` and confirming it in the terminal result.
    pub fn answer(text: &str) -> Self {
        Self::new(vec![
            ProviderEvent::AnswerDelta {
                text: text.to_string(),
            },
            ProviderEvent::Result {
                subtype: "success".to_string(),
                text: text.to_string(),
                is_error: false,
                error: None,
            },
        ])
    }

    /// A turn that streams `partial`, then hangs until interrupted and ends
    /// with a closed stream.
    pub fn until_interrupted(partial: &str) -> Self {
        Self {
            events: vec![ProviderEvent::AnswerDelta {
                text: partial.to_string(),
            }],
            end: Err(TurnError::StreamClosed),
            wait_for_interrupt: true,
            delay: None,
        }
    }

    pub fn ending_with(mut self, end: Result<(), TurnError>) -> Self {
        self.end = end;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
struct EngineState {
    turns: VecDeque<ScriptedTurn>,
    prompts: Vec<String>,
}

/// Engine whose sessions replay scripted turns in order.
#[derive(Debug, Clone)]
pub struct MockAiEngine {
    id: String,
    available: Arc<AtomicBool>,
    start_delay: Arc<Mutex<Option<Duration>>>,
    state: Arc<Mutex<EngineState>>,
    sessions_started: Arc<AtomicUsize>,
    sessions_closed: Arc<AtomicUsize>,
}

impl MockAiEngine {
    pub fn new(id: &str, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            id: id.to_string(),
            available: Arc::new(AtomicBool::new(true)),
            start_delay: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(EngineState {
                turns: turns.into(),
                prompts: Vec::new(),
            })),
            sessions_started: Arc::new(AtomicUsize::new(0)),
            sessions_closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes `start_session` take this long.
    pub fn set_start_delay(&self, delay: Duration) {
        *lock(&self.start_delay) = Some(delay);
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        lock(&self.state).turns.push_back(turn);
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.state).prompts.clone()
    }

    pub fn sessions_started(&self) -> usize {
        self.sessions_started.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    fn next_turn(&self, prompt: &str) -> ScriptedTurn {
        let mut state = lock(&self.state);
        state.prompts.push(prompt.to_string());
        state
            .turns
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::new(Vec::new()))
    }
}

#[async_trait]
impl AiEngine for MockAiEngine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn ask(&self, prompt: &str) -> Result<String, TurnError> {
        let session = MockSession::new(self.clone(), "one-shot".to_string());
        session
            .ask_stream(prompt, CancellationToken::new(), &|_| {})
            .await
    }

    async fn start_session(&self) -> Result<Box<dyn AiSession>, TurnError> {
        let delay = *lock(&self.start_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.sessions_started.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockSession::new(self.clone(), format!("mock-session-{n}"))))
    }
}

/// Session replaying the engine's scripted turns.
pub struct MockSession {
    engine: MockAiEngine,
    id: String,
}

impl MockSession {
    fn new(engine: MockAiEngine, id: String) -> Self {
        Self { engine, id }
    }
}

#[async_trait]
impl AiSession for MockSession {
    fn provider_session_id(&self) -> &str {
        &self.id
    }

    async fn ask_stream(
        &self,
        prompt: &str,
        interrupt: CancellationToken,
        on_chunk: &ChunkFn<'_>,
    ) -> Result<String, TurnError> {
        let turn = self.engine.next_turn(prompt);

        let mut normalizer = TurnNormalizer::new(60);
        for event in turn.events {
            normalizer.apply(event, on_chunk);
        }

        if turn.wait_for_interrupt {
            interrupt.cancelled().await;
        }
        if let Some(delay) = turn.delay {
            tokio::time::sleep(delay).await;
        }
        normalizer.finish(turn.end)
    }

    async fn close(&self) -> Result<(), TurnError> {
        self.engine.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
