//! Turn normalization state machine.
//!
//! Consumes the [`ProviderEvent`]s of one turn, forwards numbered
//! [`StreamChunk`]s as soon as content is available and resolves the final
//! answer once the stream ends.
//!
//! Final text comes from the first non-blank channel in this order: the
//! terminal result, whole messages, partial stream text.

use super::tools::summarize_tool;
use crate::text::{is_blank, tail_chars};
use lab_proto::{ChunkFn, ChunkKind, ProviderEvent, StreamChunk, TurnDebug, TurnError};

/// Raw diagnostic output kept for the debug snapshot of a failed turn.
pub const RAW_TAIL_CHARS: usize = 4000;

/// Error reported when a turn produced no text and no error detail.
pub const EMPTY_RESPONSE: &str = "empty response";

/// How a turn ended, as reported to dashboard clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(String),
    /// The user interrupted the turn; carries the text resolved so far.
    Interrupted(Option<String>),
    Failed(TurnError),
}

/// Classifies a finished turn.
///
/// The interrupted flag is only consulted here, after the stream has ended:
/// any ending of an interrupted turn counts as a clean interruption, while an
/// uninterrupted turn keeps its own result.
pub fn classify_outcome(result: Result<String, TurnError>, interrupted: bool) -> TurnOutcome {
    match (result, interrupted) {
        (Ok(text), false) => TurnOutcome::Completed(text),
        (Err(e), false) => TurnOutcome::Failed(e),
        (Ok(text), true) => TurnOutcome::Interrupted(Some(text)),
        (Err(_), true) => TurnOutcome::Interrupted(None),
    }
}

/// Picks the final text of a turn by channel precedence.
pub fn resolve_final_text<'a>(result: &'a str, message: &'a str, stream: &'a str) -> Option<&'a str> {
    [result, message, stream].into_iter().find(|s| !is_blank(s))
}

struct ToolCall {
    name: String,
    input: String,
}

/// Per-turn accumulator.
pub struct TurnNormalizer {
    seq: u64,
    timeout_secs: u64,
    stream_text: String,
    message_text: String,
    result_text: String,
    result_error: Option<String>,
    message_error: Option<String>,
    message_count: u32,
    event_count: u32,
    last_message_type: Option<String>,
    last_event_type: Option<String>,
    tool: Option<ToolCall>,
    raw_tail: String,
}

impl TurnNormalizer {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            seq: 0,
            timeout_secs,
            stream_text: String::new(),
            message_text: String::new(),
            result_text: String::new(),
            result_error: None,
            message_error: None,
            message_count: 0,
            event_count: 0,
            last_message_type: None,
            last_event_type: None,
            tool: None,
            raw_tail: String::new(),
        }
    }

    /// Sequence number of the last emitted chunk (0 before the first).
    pub fn last_seq(&self) -> u64 {
        self.seq
    }

    /// Applies one provider event, emitting chunks through `on_chunk`.
    pub fn apply(&mut self, event: ProviderEvent, on_chunk: &ChunkFn<'_>) {
        let source = event.native_type().to_string();

        match event {
            ProviderEvent::ThinkingDelta { text } => {
                self.saw_event(&source);
                self.emit(ChunkKind::Thinking, text, source, on_chunk);
            }
            ProviderEvent::AnswerDelta { text } => {
                self.saw_event(&source);
                self.stream_text.push_str(&text);
                self.emit(ChunkKind::Answer, text, source, on_chunk);
            }
            ProviderEvent::ToolStart { name } => {
                self.saw_event(&source);
                self.tool = Some(ToolCall {
                    name,
                    input: String::new(),
                });
            }
            ProviderEvent::ToolInputDelta { fragment } => {
                self.saw_event(&source);
                if let Some(tool) = self.tool.as_mut() {
                    tool.input.push_str(&fragment);
                }
            }
            ProviderEvent::BlockStop => {
                self.saw_event(&source);
                if let Some(tool) = self.tool.take() {
                    let summary = summarize_tool(&tool.name, &tool.input);
                    self.emit(ChunkKind::Meta, summary, source, on_chunk);
                }
            }
            ProviderEvent::Message { kind, texts, error } => {
                self.saw_message(&kind);
                for text in texts.into_iter().filter(|t| !is_blank(t)) {
                    if !self.message_text.is_empty() {
                        self.message_text.push('\n');
                    }
                    self.message_text.push_str(&text);
                    // Providers that only send whole messages still stream visibly
                    if self.stream_text.is_empty() {
                        self.emit(ChunkKind::Answer, text, source.clone(), on_chunk);
                    }
                }
                if let Some(error) = error.filter(|e| !is_blank(e)) {
                    self.message_error.get_or_insert(error);
                }
            }
            ProviderEvent::Result {
                subtype,
                text,
                is_error,
                error,
            } => {
                self.saw_message(&source);
                if is_error || subtype.starts_with("error") {
                    let detail = error
                        .filter(|e| !is_blank(e))
                        .or_else(|| (!is_blank(&text)).then_some(text))
                        .unwrap_or_else(|| format!("provider reported {subtype}"));
                    self.result_error = Some(detail);
                } else {
                    self.result_text = text;
                }
            }
        }
    }

    /// Keeps a bounded tail of raw diagnostic output (stderr, unparsed lines).
    pub fn record_diagnostic(&mut self, line: &str) {
        self.raw_tail.push_str(line);
        self.raw_tail.push('\n');
        if self.raw_tail.len() > RAW_TAIL_CHARS * 2 {
            self.raw_tail = tail_chars(&self.raw_tail, RAW_TAIL_CHARS).to_string();
        }
    }

    pub fn debug_snapshot(&self) -> TurnDebug {
        TurnDebug {
            message_count: self.message_count,
            event_count: self.event_count,
            stream_chars: self.stream_text.chars().count(),
            assistant_chars: self.message_text.chars().count(),
            result_chars: self.result_text.chars().count(),
            last_message_type: self.last_message_type.clone(),
            last_event_type: self.last_event_type.clone(),
            timeout_secs: self.timeout_secs,
            raw_tail: tail_chars(&self.raw_tail, RAW_TAIL_CHARS).to_string(),
        }
    }

    /// Ends the turn.
    ///
    /// A stream-closed ending is a normal end of turn; any other error is
    /// returned verbatim.
    pub fn finish(self, end: Result<(), TurnError>) -> Result<String, TurnError> {
        match end {
            Ok(()) | Err(TurnError::StreamClosed) => {}
            Err(e) => return Err(e),
        }

        if let Some(text) =
            resolve_final_text(&self.result_text, &self.message_text, &self.stream_text)
        {
            return Ok(text.to_string());
        }

        let message = self
            .result_error
            .clone()
            .or_else(|| self.message_error.clone())
            .unwrap_or_else(|| EMPTY_RESPONSE.to_string());
        Err(TurnError::Failed {
            message,
            debug: Box::new(self.debug_snapshot()),
        })
    }

    fn saw_event(&mut self, kind: &str) {
        self.event_count += 1;
        self.last_event_type = Some(kind.to_string());
    }

    fn saw_message(&mut self, kind: &str) {
        self.message_count += 1;
        self.last_message_type = Some(kind.to_string());
    }

    fn emit(&mut self, kind: ChunkKind, text: String, source: String, on_chunk: &ChunkFn<'_>) {
        if text.is_empty() {
            return;
        }
        self.seq += 1;
        on_chunk(StreamChunk {
            kind,
            text,
            source,
            seq: self.seq,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collector() -> (Arc<Mutex<Vec<StreamChunk>>>, impl Fn(StreamChunk) + Send + Sync) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        (chunks, move |chunk| sink.lock().unwrap().push(chunk))
    }

    fn answer(text: &str) -> ProviderEvent {
        ProviderEvent::AnswerDelta {
            text: text.to_string(),
        }
    }

    fn message(texts: &[&str]) -> ProviderEvent {
        ProviderEvent::Message {
            kind: "assistant".to_string(),
            texts: texts.iter().map(ToString::to_string).collect(),
            error: None,
        }
    }

    fn result(text: &str) -> ProviderEvent {
        ProviderEvent::Result {
            subtype: "success".to_string(),
            text: text.to_string(),
            is_error: false,
            error: None,
        }
    }

    fn run(events: Vec<ProviderEvent>, end: Result<(), TurnError>) -> Result<String, TurnError> {
        let (_, on_chunk) = collector();
        let mut turn = TurnNormalizer::new(60);
        for event in events {
            turn.apply(event, &on_chunk);
        }
        turn.finish(end)
    }

    #[test]
    fn test_precedence_result_message_stream() {
        assert_eq!(
            run(vec![answer("S"), message(&["A"]), result("R")], Ok(())),
            Ok("R".to_string())
        );
        assert_eq!(
            run(vec![answer("S"), message(&["A"]), result("  ")], Ok(())),
            Ok("A".to_string())
        );
        assert_eq!(
            run(vec![answer("S"), message(&[" "]), result("")], Ok(())),
            Ok("S".to_string())
        );

        let err = run(vec![answer(" "), message(&[""]), result("")], Ok(())).unwrap_err();
        assert_eq!(err.to_string(), EMPTY_RESPONSE);
        assert!(err.debug().is_some());
    }

    #[test]
    fn test_resolve_final_text() {
        assert_eq!(resolve_final_text("R", "A", "S"), Some("R"));
        assert_eq!(resolve_final_text("", "A", "S"), Some("A"));
        assert_eq!(resolve_final_text("\n", "\t", "S"), Some("S"));
        assert_eq!(resolve_final_text("", " ", ""), None);
    }

    #[test]
    fn test_failure_detail_order() {
        let error_result = ProviderEvent::Result {
            subtype: "error_during_execution".to_string(),
            text: String::new(),
            is_error: true,
            error: Some("rate limited".to_string()),
        };
        let error_message = ProviderEvent::Message {
            kind: "assistant".to_string(),
            texts: vec![],
            error: Some("authentication_failed".to_string()),
        };

        let err = run(vec![error_message.clone(), error_result], Ok(())).unwrap_err();
        assert_eq!(err.to_string(), "rate limited");

        let err = run(vec![error_message], Ok(())).unwrap_err();
        assert_eq!(err.to_string(), "authentication_failed");
    }

    #[test]
    fn test_error_result_text_is_not_an_answer() {
        let events = vec![ProviderEvent::Result {
            subtype: "error_max_turns".to_string(),
            text: "Reached max turns".to_string(),
            is_error: true,
            error: None,
        }];
        let err = run(events, Ok(())).unwrap_err();
        assert_eq!(err.to_string(), "Reached max turns");
    }

    #[test]
    fn test_debug_snapshot_contents() {
        let (_, on_chunk) = collector();
        let mut turn = TurnNormalizer::new(90);
        turn.apply(
            ProviderEvent::ThinkingDelta {
                text: "hmm".to_string(),
            },
            &on_chunk,
        );
        turn.apply(message(&[]), &on_chunk);
        turn.record_diagnostic("stderr: warning: model overloaded");

        let Err(TurnError::Failed { debug, .. }) = turn.finish(Ok(())) else {
            panic!("expected failure");
        };
        assert_eq!(debug.message_count, 1);
        assert_eq!(debug.event_count, 1);
        assert_eq!(debug.last_message_type.as_deref(), Some("assistant"));
        assert_eq!(debug.last_event_type.as_deref(), Some("thinking_delta"));
        assert_eq!(debug.timeout_secs, 90);
        assert!(debug.raw_tail.contains("model overloaded"));
    }

    #[test]
    fn test_raw_tail_bounded() {
        let mut turn = TurnNormalizer::new(1);
        for _ in 0..1_000 {
            turn.record_diagnostic(&"z".repeat(50));
        }
        assert_eq!(turn.debug_snapshot().raw_tail.chars().count(), RAW_TAIL_CHARS);
    }

    #[test]
    fn test_stream_closed_is_normal_end() {
        assert_eq!(
            run(vec![answer("partial")], Err(TurnError::StreamClosed)),
            Ok("partial".to_string())
        );
    }

    #[test]
    fn test_cancellation_propagates_verbatim() {
        assert_eq!(
            run(vec![result("R")], Err(TurnError::Cancelled)),
            Err(TurnError::Cancelled)
        );
        assert_eq!(
            run(vec![], Err(TurnError::DeadlineExceeded { timeout_secs: 30 })),
            Err(TurnError::DeadlineExceeded { timeout_secs: 30 })
        );
    }

    #[test]
    fn test_sequence_numbers_gapless() {
        let (chunks, on_chunk) = collector();
        let mut turn = TurnNormalizer::new(60);
        turn.apply(
            ProviderEvent::ThinkingDelta {
                text: "think".to_string(),
            },
            &on_chunk,
        );
        turn.apply(answer("a"), &on_chunk);
        turn.apply(answer(""), &on_chunk);
        turn.apply(
            ProviderEvent::ToolStart {
                name: "Bash".to_string(),
            },
            &on_chunk,
        );
        turn.apply(
            ProviderEvent::ToolInputDelta {
                fragment: r#"{"command":"#.to_string(),
            },
            &on_chunk,
        );
        turn.apply(
            ProviderEvent::ToolInputDelta {
                fragment: r#""ls -la"}"#.to_string(),
            },
            &on_chunk,
        );
        turn.apply(ProviderEvent::BlockStop, &on_chunk);
        turn.apply(answer("b"), &on_chunk);

        let chunks = chunks.lock().unwrap();
        let seqs: Vec<u64> = chunks.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(chunks[0].kind, ChunkKind::Thinking);
        assert_eq!(chunks[2].kind, ChunkKind::Meta);
        assert_eq!(chunks[2].text, "Bash: ls -la");
        assert_eq!(chunks[2].source, "content_block_stop");
        assert_eq!(turn.last_seq(), 4);
    }

    #[test]
    fn test_block_stop_without_tool_emits_nothing() {
        let (chunks, on_chunk) = collector();
        let mut turn = TurnNormalizer::new(60);
        turn.apply(ProviderEvent::BlockStop, &on_chunk);
        assert!(chunks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_message_surfaced_until_stream_text_seen() {
        let (chunks, on_chunk) = collector();
        let mut turn = TurnNormalizer::new(60);
        turn.apply(message(&["first block", "second block"]), &on_chunk);
        turn.apply(answer("streamed"), &on_chunk);
        turn.apply(message(&["full message"]), &on_chunk);

        let chunks = chunks.lock().unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["first block", "second block", "streamed"]);
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::Answer));
        assert_eq!(chunks[0].source, "assistant");
    }

    #[test]
    fn test_classify_outcome() {
        assert_eq!(
            classify_outcome(Ok("done".into()), false),
            TurnOutcome::Completed("done".into())
        );
        assert_eq!(
            classify_outcome(Err(TurnError::StreamClosed), true),
            TurnOutcome::Interrupted(None)
        );
        assert_eq!(
            classify_outcome(Err(TurnError::StreamClosed), false),
            TurnOutcome::Failed(TurnError::StreamClosed)
        );
        assert_eq!(
            classify_outcome(Ok("partial".into()), true),
            TurnOutcome::Interrupted(Some("partial".into()))
        );
    }
}
