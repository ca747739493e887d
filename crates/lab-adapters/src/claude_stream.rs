//! Claude stream event types for parsing `--output-format stream-json` output.
//!
//! With `--include-partial-messages`, Claude emits newline-delimited JSON that
//! interleaves raw API stream events (`stream_event`) with whole `assistant`
//! messages and a terminal `result`. [`ClaudeStreamEvent::into_provider_events`]
//! maps each line onto the normalized [`ProviderEvent`] vocabulary.

use lab_core::truncate_with_ellipsis;
use lab_proto::ProviderEvent;
use serde::Deserialize;

/// Events emitted by Claude's `--output-format stream-json`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeStreamEvent {
    /// Session initialization, first event of every invocation.
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// A raw API streaming event.
    StreamEvent { event: ApiStreamEvent },

    /// A complete assistant message.
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        error: Option<String>,
    },

    /// Tool results fed back to Claude.
    User,

    /// Turn complete.
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// The API streaming events this adapter understands.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiStreamEvent {
    ContentBlockStart { content_block: ContentBlock },
    ContentBlockDelta { delta: Delta },
    ContentBlockStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

/// Content blocks of assistant messages and `content_block_start` events.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse { name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl ClaudeStreamEvent {
    /// Session id announced by `system` and `result` events.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. } | Self::Result { session_id, .. } => {
                session_id.as_deref()
            }
            _ => None,
        }
    }

    /// Translates one native event into normalized provider events.
    pub fn into_provider_events(self) -> Vec<ProviderEvent> {
        match self {
            Self::System { .. } | Self::User => Vec::new(),
            Self::StreamEvent { event } => match event {
                ApiStreamEvent::ContentBlockStart {
                    content_block: ContentBlock::ToolUse { name },
                } => vec![ProviderEvent::ToolStart { name }],
                ApiStreamEvent::ContentBlockStart { .. } | ApiStreamEvent::Other => Vec::new(),
                ApiStreamEvent::ContentBlockDelta { delta } => match delta {
                    Delta::TextDelta { text } => vec![ProviderEvent::AnswerDelta { text }],
                    Delta::ThinkingDelta { thinking } => {
                        vec![ProviderEvent::ThinkingDelta { text: thinking }]
                    }
                    Delta::InputJsonDelta { partial_json } => {
                        vec![ProviderEvent::ToolInputDelta {
                            fragment: partial_json,
                        }]
                    }
                    Delta::Other => Vec::new(),
                },
                ApiStreamEvent::ContentBlockStop => vec![ProviderEvent::BlockStop],
            },
            Self::Assistant { message, error } => {
                let texts = message
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect();
                vec![ProviderEvent::Message {
                    kind: "assistant".to_string(),
                    texts,
                    error,
                }]
            }
            Self::Result {
                subtype,
                result,
                is_error,
                ..
            } => vec![ProviderEvent::Result {
                subtype,
                text: result.unwrap_or_default(),
                is_error,
                error: None,
            }],
        }
    }
}

/// Parses NDJSON lines from Claude's stream output.
pub struct ClaudeStreamParser;

impl ClaudeStreamParser {
    /// Parse a single line of NDJSON output.
    ///
    /// Returns `None` for empty lines or malformed JSON (logged at debug level).
    pub fn parse_line(line: &str) -> Option<ClaudeStreamEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        match serde_json::from_str::<ClaudeStreamEvent>(trimmed) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(
                    "Skipping malformed JSON line: {} (error: {})",
                    truncate_with_ellipsis(trimmed, 100),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(line: &str) -> Vec<ProviderEvent> {
        ClaudeStreamParser::parse_line(line)
            .unwrap()
            .into_provider_events()
    }

    #[test]
    fn test_parse_system_event() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc123","model":"claude","tools":[]}"#;
        let event = ClaudeStreamParser::parse_line(json).unwrap();
        assert_eq!(event.session_id(), Some("abc123"));
        assert!(event.into_provider_events().is_empty());
    }

    #[test]
    fn test_text_and_thinking_deltas() {
        assert_eq!(
            events(
                r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}}"#
            ),
            vec![ProviderEvent::AnswerDelta {
                text: "Hello".into()
            }]
        );
        assert_eq!(
            events(
                r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}}"#
            ),
            vec![ProviderEvent::ThinkingDelta { text: "hmm".into() }]
        );
    }

    #[test]
    fn test_tool_block_lifecycle() {
        assert_eq!(
            events(
                r#"{"type":"stream_event","event":{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"Bash","input":{}}}}"#
            ),
            vec![ProviderEvent::ToolStart {
                name: "Bash".into()
            }]
        );
        assert_eq!(
            events(
                r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\":"}}}"#
            ),
            vec![ProviderEvent::ToolInputDelta {
                fragment: "{\"command\":".into()
            }]
        );
        assert_eq!(
            events(r#"{"type":"stream_event","event":{"type":"content_block_stop","index":1}}"#),
            vec![ProviderEvent::BlockStop]
        );
    }

    #[test]
    fn test_unknown_stream_events_are_ignored() {
        assert!(
            events(r#"{"type":"stream_event","event":{"type":"message_start","message":{}}}"#)
                .is_empty()
        );
        assert!(
            events(
                r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"x"}}}"#
            )
            .is_empty()
        );
    }

    #[test]
    fn test_assistant_message_keeps_text_blocks() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Found it"},{"type":"tool_use","id":"t1","name":"Read","input":{}}]}}"#;
        assert_eq!(
            events(json),
            vec![ProviderEvent::Message {
                kind: "assistant".into(),
                texts: vec!["Found it".into()],
                error: None,
            }]
        );
    }

    #[test]
    fn test_result_event() {
        let json = r#"{"type":"result","subtype":"success","result":"All good","is_error":false,"session_id":"s1","duration_ms":5000}"#;
        let event = ClaudeStreamParser::parse_line(json).unwrap();
        assert_eq!(event.session_id(), Some("s1"));
        assert_eq!(
            event.into_provider_events(),
            vec![ProviderEvent::Result {
                subtype: "success".into(),
                text: "All good".into(),
                is_error: false,
                error: None,
            }]
        );

        let failed = r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#;
        match &events(failed)[0] {
            ProviderEvent::Result { subtype, text, .. } => {
                assert_eq!(subtype, "error_max_turns");
                assert!(text.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_empty_and_malformed_lines() {
        assert!(ClaudeStreamParser::parse_line("").is_none());
        assert!(ClaudeStreamParser::parse_line("   ").is_none());
        assert!(ClaudeStreamParser::parse_line("{not valid json}").is_none());
        assert!(ClaudeStreamParser::parse_line("plain text").is_none());
        assert!(ClaudeStreamParser::parse_line("{\"type\":\"unknown\"}").is_none());
    }
}
