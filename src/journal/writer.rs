//! Single-writer append path for a session journal.
//!
//! [`JournalWriter::open`] loads the sidecar (the session must already
//! exist), recovers the cursor from the journal tail when the sidecar has no
//! usable `lastCursor`, and opens the `.jsonl` in append mode. `append`
//! writes one record per call; `commit` rewrites the sidecar atomically.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use super::event::{EventData, JournalRecord};
use super::{JournalPaths, Sidecar, SidecarPatch};

/// How much of the journal tail is scanned when recovering the cursor.
const RECOVERY_TAIL_BYTES: u64 = 64 * 1024;

/// Journal failures surfaced to callers.
#[derive(Debug)]
pub enum JournalError {
    /// No sidecar exists for the session id.
    SessionNotFound(String),
    Io(std::io::Error),
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "Session {id} not found"),
            Self::Io(e) => write!(f, "Journal I/O error: {e}"),
        }
    }
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Append-only journal writer for one session.
///
/// Single-writer discipline is the caller's responsibility: the exec engine
/// opens at most one writer per session at a time.
pub struct JournalWriter {
    session_id: String,
    sidecar_path: PathBuf,
    file: File,
    cursor: u64,
    sidecar: Sidecar,
}

impl JournalWriter {
    /// Open the writer for an existing session.
    ///
    /// Fails with [`JournalError::SessionNotFound`] when the sidecar is
    /// absent. A corrupt sidecar is salvaged field-by-field; a missing
    /// `lastCursor` is recovered from the journal tail.
    pub async fn open(paths: &JournalPaths, session_id: &str) -> Result<Self, JournalError> {
        let sidecar_path = paths.sidecar_file(session_id);
        let raw = match fs::read(&sidecar_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JournalError::SessionNotFound(session_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let sidecar = serde_json::from_slice::<serde_json::Value>(&raw)
            .map(|v| Sidecar::from_json_lenient(&v))
            .unwrap_or_default();

        let events_path = paths.events_file(session_id);
        let cursor = match sidecar.last_cursor {
            Some(c) => c,
            None => {
                let recovered = recover_cursor_from_tail(&events_path).await.unwrap_or(0);
                if recovered > 0 {
                    warn!("Session {session_id}: recovered cursor {recovered} from journal tail");
                }
                recovered
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .await?;

        Ok(Self {
            session_id: session_id.to_string(),
            sidecar_path,
            file,
            cursor,
            sidecar,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Highest cursor appended (or recovered) so far.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Cursor the next `append` will assign.
    pub fn next_cursor(&self) -> u64 {
        self.cursor + 1
    }

    /// Sidecar contents as of open, plus any committed patches.
    pub fn sidecar(&self) -> &Sidecar {
        &self.sidecar
    }

    /// Append one record, returning its cursor.
    pub async fn append(&mut self, event: &EventData) -> Result<u64, JournalError> {
        let cursor = self.cursor + 1;
        let record = JournalRecord::new(cursor, event);
        let mut line = serde_json::to_string(&record).map_err(std::io::Error::other)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        self.cursor = cursor;
        Ok(cursor)
    }

    /// Merge `patch` over the sidecar, stamp `lastCursor`, and rewrite the
    /// sidecar atomically (temp file + rename).
    pub async fn commit(&mut self, patch: SidecarPatch) -> Result<(), JournalError> {
        if let Some(model) = patch.model {
            self.sidecar.model = Some(model);
        }
        if let Some(at) = patch.last_message_at {
            self.sidecar.last_message_at = Some(at);
        }
        if let Some(preview) = patch.last_message_preview {
            self.sidecar.last_message_preview = Some(preview);
        }
        if let Some(count) = patch.message_count {
            self.sidecar.message_count = count;
        }
        if let Some(thread) = patch.latest_thread_id {
            self.sidecar.latest_thread_id = Some(thread);
        }
        if let Some(usage) = patch.usage {
            self.sidecar.usage = Some(usage);
        }
        if let Some(info) = patch.context_info {
            self.sidecar.context_info = Some(info);
        }
        self.sidecar.last_cursor = Some(self.cursor);

        let body = serde_json::to_vec(&self.sidecar).map_err(std::io::Error::other)?;
        let tmp_path = self.sidecar_path.with_extension("json.tmp");
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&body).await?;
        tmp.flush().await?;
        drop(tmp);
        fs::rename(&tmp_path, &self.sidecar_path).await?;
        Ok(())
    }
}

/// Scan the last ≤64 KiB of a journal for the highest-cursor valid record.
///
/// Malformed trailing lines (a torn final write) are skipped; the first valid
/// record from the end wins. Returns `None` for a missing or empty journal.
pub async fn recover_cursor_from_tail(events_path: &Path) -> Option<u64> {
    let mut file = File::open(events_path).await.ok()?;
    let len = file.metadata().await.ok()?.len();
    let start = len.saturating_sub(RECOVERY_TAIL_BYTES);
    file.seek(SeekFrom::Start(start)).await.ok()?;
    let mut tail = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut tail).await.ok()?;

    for chunk in tail.split(|&b| b == b'\n').rev() {
        if chunk.is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_slice::<JournalRecord>(chunk) {
            return Some(record.cursor);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::event::{ContentBlock, ContentBlockEvent, MessageEnd, StopReason};
    use tempfile::TempDir;

    async fn seeded_paths(session_id: &str) -> (TempDir, JournalPaths) {
        let dir = TempDir::new().unwrap();
        let paths = JournalPaths::new(dir.path());
        paths.ensure_tree().await.unwrap();
        let sidecar = Sidecar {
            id: session_id.to_string(),
            cwd: "/work".to_string(),
            created_at: 1,
            ..Sidecar::default()
        };
        fs::write(
            paths.sidecar_file(session_id),
            serde_json::to_vec(&sidecar).unwrap(),
        )
        .await
        .unwrap();
        (dir, paths)
    }

    fn text_block(message_id: &str, index: u64, text: &str) -> EventData {
        EventData::ContentBlock(ContentBlockEvent {
            message_id: message_id.to_string(),
            index,
            block: ContentBlock::Text {
                text: text.to_string(),
            },
        })
    }

    #[tokio::test]
    async fn test_open_missing_session() {
        let dir = TempDir::new().unwrap();
        let paths = JournalPaths::new(dir.path());
        paths.ensure_tree().await.unwrap();
        match JournalWriter::open(&paths, "nope").await {
            Err(JournalError::SessionNotFound(id)) => assert_eq!(id, "nope"),
            other => panic!("expected SessionNotFound, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_cursors() {
        let (_dir, paths) = seeded_paths("s1").await;
        let mut writer = JournalWriter::open(&paths, "s1").await.unwrap();
        assert_eq!(writer.append(&text_block("m1", 0, "a")).await.unwrap(), 1);
        assert_eq!(writer.append(&text_block("m1", 1, "b")).await.unwrap(), 2);
        assert_eq!(writer.append(&text_block("m1", 2, "c")).await.unwrap(), 3);

        let body = fs::read_to_string(paths.events_file("s1")).await.unwrap();
        let cursors: Vec<u64> = body
            .lines()
            .map(|l| serde_json::from_str::<JournalRecord>(l).unwrap().cursor)
            .collect();
        assert_eq!(cursors, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_commit_stamps_last_cursor() {
        let (_dir, paths) = seeded_paths("s1").await;
        let mut writer = JournalWriter::open(&paths, "s1").await.unwrap();
        writer.append(&text_block("m1", 0, "a")).await.unwrap();
        writer.append(&text_block("m1", 1, "b")).await.unwrap();
        writer
            .commit(SidecarPatch {
                last_message_preview: Some("b".to_string()),
                message_count: Some(writer.cursor()),
                ..SidecarPatch::default()
            })
            .await
            .unwrap();

        let raw = fs::read(paths.sidecar_file("s1")).await.unwrap();
        let sidecar: Sidecar = serde_json::from_slice(&raw).unwrap();
        assert_eq!(sidecar.last_cursor, Some(2));
        assert_eq!(sidecar.message_count, 2);
        assert_eq!(sidecar.last_message_preview.as_deref(), Some("b"));
        // Untouched fields survive the merge
        assert_eq!(sidecar.cwd, "/work");
    }

    #[tokio::test]
    async fn test_reopen_recovers_cursor_from_tail() {
        let (_dir, paths) = seeded_paths("s1").await;
        {
            let mut writer = JournalWriter::open(&paths, "s1").await.unwrap();
            for i in 0..5 {
                writer.append(&text_block("m1", i, "x")).await.unwrap();
            }
            // No commit — sidecar still has no lastCursor
        }
        let writer = JournalWriter::open(&paths, "s1").await.unwrap();
        assert_eq!(writer.cursor(), 5);
    }

    #[tokio::test]
    async fn test_truncated_tail_is_skipped() {
        let (_dir, paths) = seeded_paths("s1").await;
        {
            let mut writer = JournalWriter::open(&paths, "s1").await.unwrap();
            writer.append(&text_block("m1", 0, "x")).await.unwrap();
            writer.append(&text_block("m1", 1, "y")).await.unwrap();
        }
        // Simulate a torn final write
        let events = paths.events_file("s1");
        let mut body = fs::read_to_string(&events).await.unwrap();
        body.push_str(r#"{"cursor":"3","event":"content_blo"#);
        fs::write(&events, body).await.unwrap();

        let mut writer = JournalWriter::open(&paths, "s1").await.unwrap();
        assert_eq!(writer.cursor(), 2);
        // Next append continues the sequence
        assert_eq!(writer.append(&text_block("m1", 2, "z")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sidecar_last_cursor_wins_over_tail() {
        let (_dir, paths) = seeded_paths("s1").await;
        {
            let mut writer = JournalWriter::open(&paths, "s1").await.unwrap();
            writer.append(&text_block("m1", 0, "x")).await.unwrap();
            writer
                .commit(SidecarPatch::default())
                .await
                .unwrap();
        }
        let writer = JournalWriter::open(&paths, "s1").await.unwrap();
        assert_eq!(writer.cursor(), 1);
    }

    #[tokio::test]
    async fn test_message_end_round_trip() {
        let (_dir, paths) = seeded_paths("s1").await;
        let mut writer = JournalWriter::open(&paths, "s1").await.unwrap();
        writer
            .append(&EventData::MessageEnd(MessageEnd {
                id: "m1".to_string(),
                stop_reason: StopReason::Cancelled,
            }))
            .await
            .unwrap();

        let body = fs::read_to_string(paths.events_file("s1")).await.unwrap();
        let record: JournalRecord = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(record.event, "message_end");
        assert_eq!(record.data["stopReason"], "cancelled");
    }
}
