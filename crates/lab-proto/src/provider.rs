//! AI provider abstraction for diagnosis sessions.
//!
//! Providers speak their own streaming formats. Adapters translate native
//! events into [`ProviderEvent`]s, and the turn state machine in `lab-core`
//! turns those into numbered [`StreamChunk`]s and a final answer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Kind of a normalized chunk of turn output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Partial reasoning text
    Thinking,
    /// Partial answer text
    Answer,
    /// Tool activity summaries and other side-channel notes
    Meta,
}

/// One normalized unit of turn output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamChunk {
    pub kind: ChunkKind,
    pub text: String,
    /// Native event type the chunk was derived from
    pub source: String,
    /// Strictly increasing within one turn, starting at 1
    pub seq: u64,
}

/// Callback receiving chunks as soon as they are produced. May borrow from
/// the caller for the duration of the turn.
pub type ChunkFn<'a> = dyn Fn(StreamChunk) + Send + Sync + 'a;

/// A provider-native event, already classified into the three categories the
/// turn state machine understands: partial deltas, whole messages, and the
/// terminal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Partial reasoning text.
    ThinkingDelta { text: String },
    /// Partial answer text.
    AnswerDelta { text: String },
    /// A tool invocation started; its input follows as fragments.
    ToolStart { name: String },
    /// A fragment of the current tool's JSON input.
    ToolInputDelta { fragment: String },
    /// The current content block (tool or text) ended.
    BlockStop,
    /// A complete message.
    Message {
        /// Native message type (e.g. "assistant")
        kind: String,
        /// Text blocks carried by the message
        texts: Vec<String>,
        /// Error marker attached to the message, if any
        error: Option<String>,
    },
    /// The terminal result of the turn.
    Result {
        subtype: String,
        text: String,
        is_error: bool,
        /// Error detail reported alongside an error subtype
        error: Option<String>,
    },
}

impl ProviderEvent {
    /// Native event type name, used as the chunk source and in debug snapshots.
    pub fn native_type(&self) -> &str {
        match self {
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::AnswerDelta { .. } => "text_delta",
            Self::ToolStart { .. } => "content_block_start",
            Self::ToolInputDelta { .. } => "input_json_delta",
            Self::BlockStop => "content_block_stop",
            Self::Message { kind, .. } => kind,
            Self::Result { .. } => "result",
        }
    }
}

/// Structured snapshot attached to every failed turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnDebug {
    pub message_count: u32,
    pub event_count: u32,
    pub stream_chars: usize,
    pub assistant_chars: usize,
    pub result_chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<String>,
    pub timeout_secs: u64,
    /// Bounded tail of raw diagnostic output (stderr, unparsed lines)
    pub raw_tail: String,
}

/// Errors ending a diagnosis turn.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TurnError {
    /// The turn was cancelled.
    #[error("turn cancelled")]
    Cancelled,

    /// The turn exceeded its deadline.
    #[error("turn deadline exceeded after {timeout_secs}s")]
    DeadlineExceeded { timeout_secs: u64 },

    /// The provider closed the stream. Treated as a normal end of turn by
    /// the turn state machine.
    #[error("stream closed")]
    StreamClosed,

    /// The turn ended without usable text.
    #[error("{message}")]
    Failed {
        message: String,
        debug: Box<TurnDebug>,
    },

    /// The provider could not be reached or misbehaved.
    #[error("provider error: {0}")]
    Provider(String),
}

impl TurnError {
    /// Debug snapshot, if this failure carries one.
    pub fn debug(&self) -> Option<&TurnDebug> {
        match self {
            Self::Failed { debug, .. } => Some(debug),
            _ => None,
        }
    }

    /// True for transport/cancellation conditions that must be reported verbatim.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded { .. })
    }
}

/// An AI engine able to open diagnosis sessions.
#[async_trait]
pub trait AiEngine: Send + Sync {
    /// Provider identifier (e.g. "claude").
    fn id(&self) -> &str;

    /// Whether the provider can currently be used.
    async fn is_available(&self) -> bool;

    /// One-shot question without a session.
    async fn ask(&self, prompt: &str) -> Result<String, TurnError>;

    /// Opens a new conversational session.
    async fn start_session(&self) -> Result<Box<dyn AiSession>, TurnError>;
}

/// A provider-side conversation. Turns are serialized by the caller.
#[async_trait]
pub trait AiSession: Send + Sync {
    /// Provider-side session identifier.
    fn provider_session_id(&self) -> &str;

    /// Runs one turn, forwarding chunks as they arrive, and returns the final text.
    ///
    /// `interrupt` is owned by the caller and scoped to this turn; once it is
    /// cancelled the provider aborts the turn and resolves whatever partial
    /// text it has.
    async fn ask_stream(
        &self,
        prompt: &str,
        interrupt: CancellationToken,
        on_chunk: &ChunkFn<'_>,
    ) -> Result<String, TurnError>;

    /// Releases provider resources.
    async fn close(&self) -> Result<(), TurnError>;
}
