//! Transcoding of the exec provider's JSON-line stdout.
//!
//! The child emits one JSON record per line. Only a handful of record types
//! matter to the journal; everything else is ignored so newer provider
//! versions can add types freely.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::journal::event::ContentBlock;

/// One line of provider stdout, as deserialized.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        thread_id: String,
    },
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Value,
    },
    #[serde(rename = "item.started")]
    ItemStarted {
        item: ProviderItem,
    },
    #[serde(rename = "item.completed")]
    ItemCompleted {
        item: ProviderItem,
    },
    #[serde(other)]
    Unknown,
}

/// Item payload inside `item.started` / `item.completed`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderItem {
    CommandExecution {
        id: String,
        #[serde(default)]
        command: String,
        #[serde(default)]
        aggregated_output: String,
        #[serde(default)]
        exit_code: Option<i64>,
    },
    AgentMessage {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Unknown,
}

/// What one stdout line means for the journal.
#[derive(Debug)]
pub enum ProviderSignal {
    /// Remember the provider-side thread id.
    ThreadStarted(String),
    /// Remember usage counters for the finalize commit.
    TurnUsage(Value),
    /// Append a content block; `assistant_text` is set when the block should
    /// also become the session preview.
    Block {
        block: ContentBlock,
        assistant_text: Option<String>,
    },
    /// Not journal-relevant (unknown type, malformed JSON, empty line).
    Ignored,
}

/// Parse and classify one line of provider stdout.
pub fn transcode_line(line: &str) -> ProviderSignal {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ProviderSignal::Ignored;
    }
    let Ok(event) = serde_json::from_str::<ProviderEvent>(trimmed) else {
        return ProviderSignal::Ignored;
    };

    match event {
        ProviderEvent::ThreadStarted { thread_id } => ProviderSignal::ThreadStarted(thread_id),
        ProviderEvent::TurnCompleted { usage } => ProviderSignal::TurnUsage(usage),
        ProviderEvent::ItemStarted { item } => match item {
            ProviderItem::CommandExecution { id, command, .. } => ProviderSignal::Block {
                block: ContentBlock::ToolUse {
                    tool_use_id: id,
                    tool_name: "bash".to_string(),
                    input: json!({ "command": command }),
                },
                assistant_text: None,
            },
            _ => ProviderSignal::Ignored,
        },
        ProviderEvent::ItemCompleted { item } => match item {
            ProviderItem::CommandExecution {
                id,
                aggregated_output,
                exit_code,
                ..
            } => {
                #[allow(clippy::cast_possible_truncation)]
                let char_count = aggregated_output.chars().count() as u64;
                ProviderSignal::Block {
                    block: ContentBlock::ToolResult {
                        tool_use_id: id,
                        content: aggregated_output,
                        is_error: exit_code.is_some_and(|c| c != 0),
                        char_count,
                    },
                    assistant_text: None,
                }
            }
            ProviderItem::AgentMessage { text } => ProviderSignal::Block {
                block: ContentBlock::Text { text: text.clone() },
                assistant_text: Some(text),
            },
            ProviderItem::Reasoning { text } => ProviderSignal::Block {
                block: ContentBlock::Thinking { thinking: text },
                assistant_text: None,
            },
            ProviderItem::Unknown => ProviderSignal::Ignored,
        },
        ProviderEvent::Unknown => ProviderSignal::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_started() {
        let signal = transcode_line(r#"{"type":"thread.started","thread_id":"t-9"}"#);
        match signal {
            ProviderSignal::ThreadStarted(id) => assert_eq!(id, "t-9"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_turn_completed_usage() {
        let signal =
            transcode_line(r#"{"type":"turn.completed","usage":{"input_tokens":10,"output_tokens":3}}"#);
        match signal {
            ProviderSignal::TurnUsage(usage) => assert_eq!(usage["input_tokens"], 10),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_command_execution_started() {
        let signal = transcode_line(
            r#"{"type":"item.started","item":{"type":"command_execution","id":"c1","command":"ls"}}"#,
        );
        match signal {
            ProviderSignal::Block {
                block:
                    ContentBlock::ToolUse {
                        tool_use_id,
                        tool_name,
                        input,
                    },
                assistant_text: None,
            } => {
                assert_eq!(tool_use_id, "c1");
                assert_eq!(tool_name, "bash");
                assert_eq!(input["command"], "ls");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_command_execution_completed() {
        let signal = transcode_line(
            r#"{"type":"item.completed","item":{"type":"command_execution","id":"c1","exit_code":0,"aggregated_output":"a\nb\n"}}"#,
        );
        match signal {
            ProviderSignal::Block {
                block:
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                        char_count,
                    },
                ..
            } => {
                assert_eq!(tool_use_id, "c1");
                assert_eq!(content, "a\nb\n");
                assert!(!is_error);
                assert_eq!(char_count, 4);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_command_execution_failed() {
        let signal = transcode_line(
            r#"{"type":"item.completed","item":{"type":"command_execution","id":"c2","exit_code":1,"aggregated_output":"no"}}"#,
        );
        match signal {
            ProviderSignal::Block {
                block: ContentBlock::ToolResult { is_error, .. },
                ..
            } => assert!(is_error),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_agent_message_sets_preview() {
        let signal = transcode_line(
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"hello"}}"#,
        );
        match signal {
            ProviderSignal::Block {
                block: ContentBlock::Text { text },
                assistant_text,
            } => {
                assert_eq!(text, "hello");
                assert_eq!(assistant_text.as_deref(), Some("hello"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_reasoning_becomes_thinking() {
        let signal = transcode_line(
            r#"{"type":"item.completed","item":{"type":"reasoning","text":"mull"}}"#,
        );
        match signal {
            ProviderSignal::Block {
                block: ContentBlock::Thinking { thinking },
                assistant_text: None,
            } => assert_eq!(thinking, "mull"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_and_garbage_ignored() {
        assert!(matches!(
            transcode_line(r#"{"type":"turn.started"}"#),
            ProviderSignal::Ignored
        ));
        assert!(matches!(
            transcode_line(
                r#"{"type":"item.started","item":{"type":"agent_message","text":"x"}}"#
            ),
            ProviderSignal::Ignored
        ));
        assert!(matches!(transcode_line("not json"), ProviderSignal::Ignored));
        assert!(matches!(transcode_line("   "), ProviderSignal::Ignored));
    }
}
