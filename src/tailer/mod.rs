//! Journal tailers and SSE fan-out.
//!
//! [`TailerManager`] owns at most one tailer task per session. Tailers never
//! hold a reference back to the manager: when idle they send their session id
//! on the retire channel and the manager runs the removal handshake. Attach
//! and retire serialize on the manager's map lock, so an attach can never
//! land on a task that has already agreed to exit.

pub mod sse;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::info;

use crate::config::Config;
use crate::engine::ExecEngine;
use crate::journal::JournalPaths;
use task::{TailerCmd, TailerSettings, TailerStats};

struct Handle {
    cmd_tx: mpsc::Sender<TailerCmd>,
}

/// Process-wide registry of live tailers. Cloneable; clones share state.
#[derive(Clone)]
pub struct TailerManager {
    inner: Arc<Mutex<HashMap<String, Handle>>>,
    paths: JournalPaths,
    engine: ExecEngine,
    settings: TailerSettings,
    retire_tx: mpsc::Sender<String>,
}

impl TailerManager {
    pub fn new(paths: JournalPaths, engine: ExecEngine, config: &Config) -> Self {
        let (retire_tx, retire_rx) = mpsc::channel(16);
        let inner: Arc<Mutex<HashMap<String, Handle>>> = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(retire_loop(Arc::clone(&inner), retire_rx));
        Self {
            inner,
            paths,
            engine,
            settings: TailerSettings {
                heartbeat_interval: Duration::from_millis(config.stream.heartbeat_interval_ms),
                idle_after: Duration::from_millis(config.stream.tailer_idle_ms),
                debounce: Duration::from_millis(config.stream.debounce_ms),
            },
            retire_tx,
        }
    }

    /// Attach an SSE client, lazily creating the session's tailer.
    ///
    /// The returned receiver yields pre-encoded SSE frames; dropping it
    /// detaches the client.
    pub async fn attach(&self, session_id: &str, since: u64, limit: usize) -> mpsc::Receiver<Bytes> {
        loop {
            let (sink, rx) = task::client_channel();
            let sent = {
                let mut map = self.inner.lock().await;
                let handle = map.entry(session_id.to_string()).or_insert_with(|| Handle {
                    cmd_tx: task::spawn(
                        session_id.to_string(),
                        self.paths.clone(),
                        self.engine.clone(),
                        self.settings,
                        self.retire_tx.clone(),
                    ),
                });
                handle
                    .cmd_tx
                    .send(TailerCmd::Attach { since, limit, sink })
                    .await
            };
            if sent.is_ok() {
                return rx;
            }
            // The task died (retired or crashed); forget it and re-create
            let mut map = self.inner.lock().await;
            map.remove(session_id);
        }
    }

    /// Diagnostics for every live tailer.
    pub async fn stats(&self) -> Vec<TailerStats> {
        let handles: Vec<mpsc::Sender<TailerCmd>> = {
            let map = self.inner.lock().await;
            map.values().map(|h| h.cmd_tx.clone()).collect()
        };
        let mut stats = Vec::with_capacity(handles.len());
        for cmd_tx in handles {
            let (reply, rx) = oneshot::channel();
            if cmd_tx.send(TailerCmd::Stats { reply }).await.is_ok() {
                if let Ok(s) = rx.await {
                    stats.push(s);
                }
            }
        }
        stats
    }

    /// Number of live tailers.
    pub async fn tailer_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Stop every tailer (process shutdown). Closes their file watchers.
    pub async fn shutdown(&self) {
        let mut map = self.inner.lock().await;
        for (id, handle) in map.drain() {
            let _ = handle.cmd_tx.send(TailerCmd::Shutdown).await;
            info!("Tailer {id}: shutdown requested");
        }
    }
}

/// Consume retire requests: confirm the tailer is still idle, then drop it.
///
/// The map lock is held across the handshake so no attach can be enqueued on
/// a task that is about to exit.
async fn retire_loop(
    inner: Arc<Mutex<HashMap<String, Handle>>>,
    mut retire_rx: mpsc::Receiver<String>,
) {
    while let Some(session_id) = retire_rx.recv().await {
        let mut map = inner.lock().await;
        let Some(handle) = map.get(&session_id) else {
            continue;
        };
        let (reply, rx) = oneshot::channel();
        match handle.cmd_tx.send(TailerCmd::TryRetire { reply }).await {
            Ok(()) => {
                if rx.await.unwrap_or(true) {
                    map.remove(&session_id);
                    info!("Tailer {session_id}: retired (idle)");
                }
            }
            Err(_) => {
                map.remove(&session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::event::JournalRecord;
    use crate::journal::Sidecar;
    use crate::util::now_ms;
    use tempfile::TempDir;

    const SESSION: &str = "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee";

    async fn setup() -> (TempDir, JournalPaths, TailerManager) {
        setup_with(Config::default()).await
    }

    async fn setup_with(config: Config) -> (TempDir, JournalPaths, TailerManager) {
        let dir = TempDir::new().unwrap();
        let paths = JournalPaths::new(dir.path());
        paths.ensure_tree().await.unwrap();
        let sidecar = Sidecar {
            id: SESSION.to_string(),
            cwd: "/work".to_string(),
            created_at: now_ms(),
            model: Some("o3".to_string()),
            ..Sidecar::default()
        };
        tokio::fs::write(
            paths.sidecar_file(SESSION),
            serde_json::to_vec(&sidecar).unwrap(),
        )
        .await
        .unwrap();

        let engine = ExecEngine::new(paths.clone(), Arc::new(config.clone()));
        let manager = TailerManager::new(paths.clone(), engine, &config);
        (dir, paths, manager)
    }

    async fn write_records(paths: &JournalPaths, range: std::ops::RangeInclusive<u64>) {
        let mut body = String::new();
        for cursor in range {
            let record = JournalRecord {
                cursor,
                event: "content_block".to_string(),
                data: serde_json::json!({"index": cursor - 1}),
            };
            body.push_str(&serde_json::to_string(&record).unwrap());
            body.push('\n');
        }
        let path = paths.events_file(SESSION);
        let existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        tokio::fs::write(&path, format!("{existing}{body}")).await.unwrap();
    }

    /// Collect frames until `history_end` arrives.
    async fn collect_history(rx: &mut mpsc::Receiver<Bytes>) -> Vec<String> {
        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for history")
                .expect("stream closed during history");
            let text = String::from_utf8_lossy(&frame).to_string();
            let done = text.contains("event: history_end");
            frames.push(text);
            if done {
                return frames;
            }
        }
    }

    fn frame_ids(frames: &[String]) -> Vec<u64> {
        frames
            .iter()
            .filter_map(|f| {
                f.lines()
                    .find_map(|l| l.strip_prefix("id: "))
                    .and_then(|id| id.parse().ok())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_attach_replays_after_since() {
        let (_dir, paths, manager) = setup().await;
        write_records(&paths, 1..=12).await;

        let mut rx = manager.attach(SESSION, 8, 1000).await;
        let frames = collect_history(&mut rx).await;

        assert!(frames[0].contains("event: session_meta"));
        assert!(frames[0].contains("\"sessionId\":\"aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee\""));
        assert!(frames[1].contains("event: history_start"));
        assert!(frames[1].contains("\"since\":8"));
        assert_eq!(frame_ids(&frames), vec![9, 10, 11, 12]);
        assert!(frames.last().unwrap().contains("\"count\":4"));
    }

    #[tokio::test]
    async fn test_attach_beyond_max_gets_empty_history() {
        let (_dir, paths, manager) = setup().await;
        write_records(&paths, 1..=5).await;

        let mut rx = manager.attach(SESSION, 99, 1000).await;
        let frames = collect_history(&mut rx).await;
        assert_eq!(frames.len(), 3); // meta, history_start, history_end
        assert!(frames[2].contains("\"count\":0"));
    }

    #[tokio::test]
    async fn test_limit_caps_replay() {
        let (_dir, paths, manager) = setup().await;
        write_records(&paths, 1..=10).await;

        let mut rx = manager.attach(SESSION, 0, 3).await;
        let frames = collect_history(&mut rx).await;
        assert_eq!(frame_ids(&frames), vec![1, 2, 3]);
        assert!(frames.last().unwrap().contains("\"count\":3"));
    }

    #[tokio::test]
    async fn test_limited_replay_backfills_second_client() {
        let (_dir, paths, manager) = setup().await;
        write_records(&paths, 1..=10).await;

        // First client reads everything; the shared position reaches EOF
        let mut a = manager.attach(SESSION, 0, 1000).await;
        collect_history(&mut a).await;

        // Second client truncates its history page; the skipped range is
        // behind the shared position and must still arrive, in order
        let mut b = manager.attach(SESSION, 0, 3).await;
        let history = collect_history(&mut b).await;
        assert_eq!(frame_ids(&history), vec![1, 2, 3]);

        let mut rest = Vec::new();
        while rest.len() < 7 {
            let frame = tokio::time::timeout(Duration::from_secs(2), b.recv())
                .await
                .expect("timed out waiting for backfill")
                .expect("stream closed during backfill");
            let text = String::from_utf8_lossy(&frame).to_string();
            if let Some(id) = text
                .lines()
                .find_map(|l| l.strip_prefix("id: "))
                .and_then(|v| v.parse::<u64>().ok())
            {
                rest.push(id);
            }
        }
        assert_eq!(rest, vec![4, 5, 6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_live_records_follow_history() {
        let (_dir, paths, manager) = setup().await;
        write_records(&paths, 1..=3).await;

        let mut rx = manager.attach(SESSION, 0, 1000).await;
        collect_history(&mut rx).await;

        write_records(&paths, 4..=6).await;

        let mut live = Vec::new();
        while live.len() < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("timed out waiting for live frames")
                .expect("stream closed");
            let text = String::from_utf8_lossy(&frame).to_string();
            if let Some(id) = text
                .lines()
                .find_map(|l| l.strip_prefix("id: "))
                .and_then(|id| id.parse::<u64>().ok())
            {
                live.push(id);
            }
        }
        assert_eq!(live, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_two_clients_same_stream_and_independent_drop() {
        let (_dir, paths, manager) = setup().await;
        write_records(&paths, 1..=2).await;

        let mut a = manager.attach(SESSION, 0, 1000).await;
        let mut b = manager.attach(SESSION, 0, 1000).await;
        let history_a = collect_history(&mut a).await;
        let history_b = collect_history(&mut b).await;
        assert_eq!(frame_ids(&history_a), vec![1, 2]);
        assert_eq!(frame_ids(&history_b), vec![1, 2]);

        drop(b);
        write_records(&paths, 3..=3).await;

        let frame = tokio::time::timeout(Duration::from_secs(3), a.recv())
            .await
            .expect("timed out")
            .expect("closed");
        assert!(String::from_utf8_lossy(&frame).contains("id: 3\n"));
        assert_eq!(manager.tailer_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let (_dir, paths, manager) = setup().await;
        write_records(&paths, 1..=2).await;
        let path = paths.events_file(SESSION);
        let mut body = tokio::fs::read_to_string(&path).await.unwrap();
        body.push_str("this is not json\n");
        tokio::fs::write(&path, body).await.unwrap();
        write_records(&paths, 3..=3).await;

        let mut rx = manager.attach(SESSION, 0, 1000).await;
        let frames = collect_history(&mut rx).await;
        assert_eq!(frame_ids(&frames), vec![1, 2, 3]);
        assert!(frames.last().unwrap().contains("\"count\":3"));
    }

    #[tokio::test]
    async fn test_idle_tailer_retires_and_recreates() {
        // Compressed timers: heartbeats discover the dropped client fast,
        // then the idle timer retires the tailer.
        let mut config = Config::default();
        config.stream.heartbeat_interval_ms = 100;
        config.stream.tailer_idle_ms = 200;
        let (_dir, paths, manager) = setup_with(config).await;
        write_records(&paths, 1..=2).await;

        {
            let mut rx = manager.attach(SESSION, 0, 1000).await;
            collect_history(&mut rx).await;
            assert_eq!(manager.tailer_count().await, 1);
        }
        // Client dropped; tailer should retire within idle + discovery slack
        let mut retired = false;
        for _ in 0..100 {
            if manager.tailer_count().await == 0 {
                retired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(retired, "tailer did not retire after idle period");

        // A new attach lazily re-creates the tailer and replays correctly
        let mut rx = manager.attach(SESSION, 0, 1000).await;
        let frames = collect_history(&mut rx).await;
        assert_eq!(frame_ids(&frames), vec![1, 2]);
        assert_eq!(manager.tailer_count().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_frames() {
        let mut config = Config::default();
        config.stream.heartbeat_interval_ms = 150;
        let (_dir, _paths, manager) = setup_with(config).await;
        let mut rx = manager.attach(SESSION, 0, 1000).await;
        collect_history(&mut rx).await;

        let frame = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for heartbeat")
            .expect("closed");
        assert_eq!(
            String::from_utf8_lossy(&frame),
            "event: heartbeat\ndata: {}\n\n\n"
        );
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let (_dir, paths, manager) = setup().await;
        write_records(&paths, 1..=4).await;
        let mut rx = manager.attach(SESSION, 0, 1000).await;
        collect_history(&mut rx).await;

        let stats = manager.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].session_id, SESSION);
        assert_eq!(stats[0].clients, 1);
        assert!(stats[0].position > 0);
    }
}
