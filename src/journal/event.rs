//! Journal record model.
//!
//! One record per line of the `.jsonl` journal:
//! `{"cursor":"<N>","event":"<kind>","data":{…}}`. The cursor is a 1-based
//! integer encoded as a string for client `Last-Event-ID` compatibility.
//!
//! The closed core kinds (`message_start`, `content_block`, `message_end`,
//! `session_meta`) are modeled as typed variants; framing-only kinds
//! (`heartbeat`, `history_start`, `history_end`) and anything a newer writer
//! may add travel as free-form JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Why a message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    Error,
    Cancelled,
}

/// `message_start` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStart {
    pub id: String,
    /// Cursor of this record itself, fixed at append time.
    pub line_number: u64,
    pub role: Role,
    pub timestamp: u64,
    pub session_id: String,
}

/// `content_block` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockEvent {
    pub message_id: String,
    pub index: u64,
    pub block: ContentBlock,
}

/// `message_end` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnd {
    pub id: String,
    pub stop_reason: StopReason,
}

/// One content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
        char_count: u64,
    },
}

/// Token accounting remembered from the provider's `turn.completed`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Context-window accounting derived from the model table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextInfo {
    pub max_tokens: Option<u64>,
    pub used_tokens: u64,
    pub percent_left: Option<f64>,
}

/// `session_meta` payload — a live snapshot, never part of the message order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub provider: String,
    pub session_id: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_info: Option<ContextInfo>,
    pub is_active: bool,
    pub queue_length: usize,
}

/// A typed journal event ready to be appended.
#[derive(Debug, Clone)]
pub enum EventData {
    MessageStart(MessageStart),
    ContentBlock(ContentBlockEvent),
    MessageEnd(MessageEnd),
    SessionMeta(SessionMeta),
    /// Forward-compatible escape hatch for kinds this writer doesn't model.
    Other { kind: String, data: Value },
}

impl EventData {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &str {
        match self {
            Self::MessageStart(_) => "message_start",
            Self::ContentBlock(_) => "content_block",
            Self::MessageEnd(_) => "message_end",
            Self::SessionMeta(_) => "session_meta",
            Self::Other { kind, .. } => kind,
        }
    }

    /// Serialize the payload to a JSON value.
    pub fn data_value(&self) -> Value {
        match self {
            Self::MessageStart(d) => serde_json::to_value(d).unwrap_or(Value::Null),
            Self::ContentBlock(d) => serde_json::to_value(d).unwrap_or(Value::Null),
            Self::MessageEnd(d) => serde_json::to_value(d).unwrap_or(Value::Null),
            Self::SessionMeta(d) => serde_json::to_value(d).unwrap_or(Value::Null),
            Self::Other { data, .. } => data.clone(),
        }
    }
}

/// One journal line, as stored on disk and replayed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    #[serde(with = "cursor_string")]
    pub cursor: u64,
    pub event: String,
    pub data: Value,
}

impl JournalRecord {
    pub fn new(cursor: u64, event: &EventData) -> Self {
        Self {
            cursor,
            event: event.kind().to_string(),
            data: event.data_value(),
        }
    }
}

/// Cursors are written as JSON strings (`"7"`) but older journals may hold
/// bare numbers; accept both on read.
mod cursor_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(cursor: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&cursor.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_cursor_serialized_as_string() {
        let event = EventData::MessageEnd(MessageEnd {
            id: "m1".to_string(),
            stop_reason: StopReason::EndTurn,
        });
        let record = JournalRecord::new(7, &event);
        let line = serde_json::to_string(&record).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["cursor"], json!("7"));
        assert_eq!(value["event"], json!("message_end"));
        assert_eq!(value["data"]["stopReason"], json!("end_turn"));
    }

    #[test]
    fn test_record_accepts_numeric_cursor() {
        let record: JournalRecord =
            serde_json::from_str(r#"{"cursor":12,"event":"heartbeat","data":{}}"#).unwrap();
        assert_eq!(record.cursor, 12);
    }

    #[test]
    fn test_content_block_wire_shape() {
        let block = ContentBlock::ToolUse {
            tool_use_id: "c1".to_string(),
            tool_name: "bash".to_string(),
            input: json!({"command": "ls"}),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tool_use",
                "toolUseId": "c1",
                "toolName": "bash",
                "input": {"command": "ls"},
            })
        );

        let block = ContentBlock::ToolResult {
            tool_use_id: "c1".to_string(),
            content: "a\nb\n".to_string(),
            is_error: false,
            char_count: 4,
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], json!("tool_result"));
        assert_eq!(value["isError"], json!(false));
        assert_eq!(value["charCount"], json!(4));
    }

    #[test]
    fn test_message_start_wire_shape() {
        let value = serde_json::to_value(MessageStart {
            id: "m1".to_string(),
            line_number: 4,
            role: Role::Assistant,
            timestamp: 1_700_000_000_000,
            session_id: "s1".to_string(),
        })
        .unwrap();
        assert_eq!(value["lineNumber"], json!(4));
        assert_eq!(value["role"], json!("assistant"));
        assert_eq!(value["sessionId"], json!("s1"));
    }

    #[test]
    fn test_content_block_round_trip() {
        let block = ContentBlock::Thinking {
            thinking: "hmm".to_string(),
        };
        let line = serde_json::to_string(&block).unwrap();
        let back: ContentBlock = serde_json::from_str(&line).unwrap();
        assert_eq!(back, block);
    }
}
