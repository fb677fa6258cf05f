//! Append-only per-session event journal with a metadata sidecar.
//!
//! Each exec session owns two files under the gateway root:
//!
//! - `codex-events/<uuid>.jsonl` — one [`event::JournalRecord`] per line,
//!   strictly append-only, cursors contiguous from 1.
//! - `codex-sessions/<uuid>.json` — the [`Sidecar`] summary, rewritten whole
//!   on every commit.
//!
//! The journal has exactly one writer (the exec engine); tailers read
//! concurrently and tolerate a sidecar that lags its journal.

pub mod event;
pub mod writer;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use event::{ContextInfo, UsageSummary};

/// Resolved locations of the two per-session files.
#[derive(Debug, Clone)]
pub struct JournalPaths {
    root: PathBuf,
}

impl JournalPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("codex-sessions")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.root.join("codex-events")
    }

    pub fn sidecar_file(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    pub fn events_file(&self, session_id: &str) -> PathBuf {
        self.events_dir().join(format!("{session_id}.jsonl"))
    }

    /// Create the directory tree. Called once at startup.
    pub async fn ensure_tree(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.sessions_dir()).await?;
        tokio::fs::create_dir_all(self.events_dir()).await?;
        Ok(())
    }
}

/// Per-session metadata sidecar.
///
/// Summary fields mirror the journal; `last_cursor` is authoritative only
/// after a commit and may lag the `.jsonl` between appends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sidecar {
    pub id: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    pub message_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cursor: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_info: Option<ContextInfo>,
}

impl Sidecar {
    /// Parse a sidecar, salvaging known fields one-by-one.
    ///
    /// A field of the wrong type (for example a non-finite `lastCursor`
    /// written by a buggy client) degrades to its default instead of failing
    /// the whole document, matching the writer's recovery contract.
    pub fn from_json_lenient(value: &Value) -> Self {
        let mut sidecar = Self::default();
        let Some(map) = value.as_object() else {
            return sidecar;
        };
        if let Some(s) = map.get("id").and_then(Value::as_str) {
            sidecar.id = s.to_string();
        }
        if let Some(s) = map.get("cwd").and_then(Value::as_str) {
            sidecar.cwd = s.to_string();
        }
        if let Some(s) = map.get("model").and_then(Value::as_str) {
            sidecar.model = Some(s.to_string());
        }
        if let Some(n) = map.get("createdAt").and_then(Value::as_u64) {
            sidecar.created_at = n;
        }
        if let Some(n) = map.get("lastMessageAt").and_then(Value::as_u64) {
            sidecar.last_message_at = Some(n);
        }
        if let Some(s) = map.get("lastMessagePreview").and_then(Value::as_str) {
            sidecar.last_message_preview = Some(s.to_string());
        }
        if let Some(n) = map.get("messageCount").and_then(Value::as_u64) {
            sidecar.message_count = n;
        }
        sidecar.last_cursor = map.get("lastCursor").and_then(Value::as_u64);
        if let Some(s) = map.get("latestThreadId").and_then(Value::as_str) {
            sidecar.latest_thread_id = Some(s.to_string());
        }
        if let Some(u) = map.get("usage") {
            sidecar.usage = serde_json::from_value(u.clone()).ok();
        }
        if let Some(c) = map.get("contextInfo") {
            sidecar.context_info = serde_json::from_value(c.clone()).ok();
        }
        sidecar
    }
}

/// Partial sidecar update merged over the current contents by
/// [`writer::JournalWriter::commit`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SidecarPatch {
    pub model: Option<String>,
    pub last_message_at: Option<u64>,
    pub last_message_preview: Option<String>,
    pub message_count: Option<u64>,
    pub latest_thread_id: Option<String>,
    pub usage: Option<UsageSummary>,
    pub context_info: Option<ContextInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paths_layout() {
        let paths = JournalPaths::new("/tmp/gw");
        assert_eq!(
            paths.sidecar_file("abc").to_str().unwrap(),
            "/tmp/gw/codex-sessions/abc.json"
        );
        assert_eq!(
            paths.events_file("abc").to_str().unwrap(),
            "/tmp/gw/codex-events/abc.jsonl"
        );
    }

    #[test]
    fn test_lenient_parse_salvages_fields() {
        let sidecar = Sidecar::from_json_lenient(&json!({
            "id": "s1",
            "cwd": "/work",
            "lastCursor": "garbage",
            "messageCount": 9,
        }));
        assert_eq!(sidecar.id, "s1");
        assert_eq!(sidecar.cwd, "/work");
        assert_eq!(sidecar.message_count, 9);
        assert!(sidecar.last_cursor.is_none());
    }

    #[test]
    fn test_lenient_parse_non_object() {
        let sidecar = Sidecar::from_json_lenient(&json!("nonsense"));
        assert!(sidecar.id.is_empty());
    }
}
