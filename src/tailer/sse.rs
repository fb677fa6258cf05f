//! SSE frame encoding.
//!
//! A frame is exactly `id: <cursor>\nevent: <kind>\ndata: <json>\n\n\n`.
//! The double-blank terminator is a compatibility contract with existing
//! clients, so frames are written by hand instead of going through a
//! framework SSE type (which emits a single blank line).

use bytes::Bytes;
use serde_json::Value;

use crate::journal::event::JournalRecord;

/// Encode one SSE frame. Frames without a journal cursor (heartbeats,
/// history sentinels, pushed `session_meta`) omit the `id:` line.
pub fn frame(id: Option<u64>, kind: &str, data: &Value) -> Bytes {
    let mut out = String::new();
    if let Some(id) = id {
        out.push_str(&format!("id: {id}\n"));
    }
    out.push_str(&format!("event: {kind}\n"));
    out.push_str(&format!("data: {data}\n\n\n"));
    Bytes::from(out)
}

/// Encode a journal record as a frame, using its cursor as the event id.
pub fn record_frame(record: &JournalRecord) -> Bytes {
    frame(Some(record.cursor), &record.event, &record.data)
}

/// The periodic keep-alive frame.
pub fn heartbeat_frame() -> Bytes {
    frame(None, "heartbeat", &Value::Object(serde_json::Map::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_layout() {
        let bytes = frame(Some(7), "message_end", &json!({"id":"m1"}));
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "id: 7\nevent: message_end\ndata: {\"id\":\"m1\"}\n\n\n"
        );
    }

    #[test]
    fn test_frame_without_id() {
        let bytes = frame(None, "history_start", &json!({"since": 8}));
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "event: history_start\ndata: {\"since\":8}\n\n\n"
        );
    }

    #[test]
    fn test_heartbeat() {
        assert_eq!(
            std::str::from_utf8(&heartbeat_frame()).unwrap(),
            "event: heartbeat\ndata: {}\n\n\n"
        );
    }

    #[test]
    fn test_record_frame_uses_cursor() {
        let record = JournalRecord {
            cursor: 12,
            event: "content_block".to_string(),
            data: json!({"index": 0}),
        };
        let bytes = record_frame(&record);
        assert!(std::str::from_utf8(&bytes).unwrap().starts_with("id: 12\n"));
    }
}
