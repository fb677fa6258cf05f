//! Per-session journal tailer.
//!
//! One actor task per session with live SSE clients. All state (client set,
//! file position) is owned by the task; mutation arrives through its command
//! channel, so no lock is shared with the rest of the process.
//!
//! A `notify` watcher on the journal directory pokes the task when the
//! `.jsonl` grows; pokes within the debounce window coalesce into one read.
//! Each client tracks the last cursor delivered to it, which makes duplicate
//! reads harmless and lets late attaches replay history without disturbing
//! live clients.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::time::Duration;

use bytes::Bytes;
use notify::{RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::sse;
use crate::engine::ExecEngine;
use crate::journal::event::JournalRecord;
use crate::journal::{JournalPaths, Sidecar};
use crate::util::now_ms;

/// Cooperative yield cadence during history replay.
const HISTORY_YIELD_EVERY: usize = 200;

/// Per-client frame buffer; a client this far behind is considered dead.
const CLIENT_BUFFER_FRAMES: usize = 256;

/// Commands accepted by a tailer task.
pub enum TailerCmd {
    /// Attach a client: replay history after `since`, then stream live.
    Attach {
        since: u64,
        limit: usize,
        sink: mpsc::Sender<Bytes>,
    },
    /// Snapshot diagnostics.
    Stats { reply: oneshot::Sender<TailerStats> },
    /// Manager asks: still idle? `true` means the task is exiting.
    TryRetire { reply: oneshot::Sender<bool> },
    /// Unconditional stop (process shutdown).
    Shutdown,
}

/// Diagnostics for `GET /api/chat-stream/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TailerStats {
    pub session_id: String,
    pub clients: usize,
    pub position: u64,
    pub frames_sent: u64,
    pub last_activity_at: u64,
}

/// Tunables copied out of the stream config.
#[derive(Debug, Clone, Copy)]
pub struct TailerSettings {
    pub heartbeat_interval: Duration,
    pub idle_after: Duration,
    pub debounce: Duration,
}

struct Client {
    tx: mpsc::Sender<Bytes>,
    /// Highest cursor delivered to this client.
    last_cursor: u64,
}

pub struct TailerTask {
    session_id: String,
    paths: JournalPaths,
    engine: ExecEngine,
    settings: TailerSettings,
    retire_tx: mpsc::Sender<String>,
    clients: HashMap<u64, Client>,
    next_client_id: u64,
    /// Byte offset of the next unread journal line.
    position: u64,
    frames_sent: u64,
    last_activity_at: u64,
    /// Set while waiting for the manager to answer a retire request.
    retire_pending: bool,
}

/// Spawn a tailer task, returning its command sender.
pub fn spawn(
    session_id: String,
    paths: JournalPaths,
    engine: ExecEngine,
    settings: TailerSettings,
    retire_tx: mpsc::Sender<String>,
) -> mpsc::Sender<TailerCmd> {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let task = TailerTask {
        session_id,
        paths,
        engine,
        settings,
        retire_tx,
        clients: HashMap::new(),
        next_client_id: 1,
        position: 0,
        frames_sent: 0,
        last_activity_at: now_ms(),
        retire_pending: false,
    };
    tokio::spawn(task.run(cmd_rx));
    cmd_tx
}

impl TailerTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<TailerCmd>) {
        info!("Tailer {}: started", self.session_id);

        // Watch the events directory (the file itself may not exist yet) and
        // poke on any change touching our journal.
        let (poke_tx, mut poke_rx) = mpsc::channel::<()>(4);
        let events_file = self.paths.events_file(&self.session_id);
        let watcher = {
            let file = events_file.clone();
            let tx = poke_tx.clone();
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if event.paths.is_empty() || event.paths.iter().any(|p| p == &file) {
                        let _ = tx.try_send(());
                    }
                }
            })
        };
        let _watcher = match watcher {
            Ok(mut w) => match w.watch(&self.paths.events_dir(), RecursiveMode::NonRecursive) {
                Ok(()) => Some(w),
                Err(e) => {
                    warn!("Tailer {}: watch failed ({e}), polling instead", self.session_id);
                    None
                }
            },
            Err(e) => {
                warn!(
                    "Tailer {}: watcher unavailable ({e}), polling instead",
                    self.session_id
                );
                None
            }
        };
        let poll_fallback = _watcher.is_none();

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut poll = tokio::time::interval(Duration::from_millis(500));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut meta_rx = self.engine.meta_sender().subscribe();
        let mut meta_open = true;
        let mut idle_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(TailerCmd::Attach { since, limit, sink }) => {
                        self.attach(since, limit, sink).await;
                    }
                    Some(TailerCmd::Stats { reply }) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(TailerCmd::TryRetire { reply }) => {
                        let retire = self.clients.is_empty();
                        self.retire_pending = false;
                        let _ = reply.send(retire);
                        if retire {
                            break;
                        }
                    }
                    Some(TailerCmd::Shutdown) | None => break,
                },
                Some(()) = poke_rx.recv() => {
                    // Stability window: coalesce bursts into one read
                    tokio::time::sleep(self.settings.debounce).await;
                    while poke_rx.try_recv().is_ok() {}
                    self.read_live().await;
                }
                _ = heartbeat.tick() => {
                    self.broadcast_raw(&sse::heartbeat_frame());
                }
                _ = poll.tick(), if poll_fallback => {
                    self.read_live().await;
                }
                changed = meta_rx.recv(), if meta_open => match changed {
                    Ok(id) if id == self.session_id => self.push_meta().await,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        self.push_meta().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => meta_open = false,
                },
                () = idle_sleep(idle_deadline), if idle_deadline.is_some() => {
                    idle_deadline = None;
                    self.retire_pending = true;
                    if self.retire_tx.send(self.session_id.clone()).await.is_err() {
                        break;
                    }
                }
            }

            // Arm or cancel the idle timer after every event
            if self.clients.is_empty() {
                if idle_deadline.is_none() && !self.retire_pending {
                    idle_deadline =
                        Some(tokio::time::Instant::now() + self.settings.idle_after);
                }
            } else {
                idle_deadline = None;
                self.retire_pending = false;
            }
        }

        info!("Tailer {}: stopped", self.session_id);
    }

    fn stats(&self) -> TailerStats {
        TailerStats {
            session_id: self.session_id.clone(),
            clients: self.clients.len(),
            position: self.position,
            frames_sent: self.frames_sent,
            last_activity_at: self.last_activity_at,
        }
    }

    async fn load_sidecar(&self) -> Sidecar {
        let path = self.paths.sidecar_file(&self.session_id);
        let mut sidecar = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<serde_json::Value>(&raw)
                .map(|v| Sidecar::from_json_lenient(&v))
                .unwrap_or_default(),
            Err(_) => Sidecar::default(),
        };
        if sidecar.id.is_empty() {
            sidecar.id = self.session_id.clone();
        }
        sidecar
    }

    /// Full attach protocol: `session_meta`, `history_start`, replay,
    /// `history_end`, then membership in the broadcast set.
    async fn attach(&mut self, since: u64, limit: usize, sink: mpsc::Sender<Bytes>) {
        let sidecar = self.load_sidecar().await;
        let meta = self.engine.session_meta_for(&sidecar).await;
        let meta_value = serde_json::to_value(&meta).unwrap_or_else(|_| json!({}));
        if sink.send(sse::frame(None, "session_meta", &meta_value)).await.is_err() {
            return;
        }
        if sink
            .send(sse::frame(None, "history_start", &json!({ "since": since })))
            .await
            .is_err()
        {
            return;
        }

        let first_client = self.clients.is_empty();
        let (count, end_position, last_cursor) = self.replay(since, limit, &sink).await;

        if sink
            .send(sse::frame(None, "history_end", &json!({ "count": count })))
            .await
            .is_err()
        {
            return;
        }

        let mut client_cursor = last_cursor.max(since);
        if first_client {
            // Only a fresh tailer may fast-forward the shared read position;
            // with live clients present it would skip their unread suffix.
            self.position = self.position.max(end_position);
        } else if end_position < self.position {
            // A limit-truncated replay stopped short of where live clients
            // already are. That range sits behind the shared position and
            // will never be re-read, so stream it to this sink directly.
            client_cursor = self
                .catch_up(&sink, end_position, self.position, client_cursor)
                .await;
        }

        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(
            id,
            Client {
                tx: sink,
                last_cursor: client_cursor,
            },
        );
        self.last_activity_at = now_ms();
        debug!(
            "Tailer {}: client {id} attached (since={since}, replayed {count})",
            self.session_id
        );
        // Deliver any suffix past the shared position (a limit-truncated
        // first attach, or records that landed mid-attach). Per-client
        // cursors keep this free of duplicates.
        self.read_live().await;
    }

    /// Stream the on-disk records in `[from, to)` to a single sink, skipping
    /// cursors at or below `after`. Returns the highest cursor delivered.
    ///
    /// Both offsets are line-aligned by construction (`from` is a replay end
    /// position, `to` is the shared read position), so the range parses as
    /// whole records.
    async fn catch_up(
        &mut self,
        sink: &mpsc::Sender<Bytes>,
        from: u64,
        to: u64,
        after: u64,
    ) -> u64 {
        let path = self.paths.events_file(&self.session_id);
        let Ok(mut file) = File::open(&path).await else {
            return after;
        };
        if file.seek(SeekFrom::Start(from)).await.is_err() {
            return after;
        }
        let mut buf = vec![0u8; (to - from) as usize];
        if file.read_exact(&mut buf).await.is_err() {
            return after;
        }
        let text = String::from_utf8_lossy(&buf);

        let mut delivered = after;
        let mut sent = 0usize;
        for line in text.lines() {
            let Ok(record) = serde_json::from_str::<JournalRecord>(line) else {
                continue;
            };
            if record.cursor <= delivered {
                continue;
            }
            if sink.send(sse::record_frame(&record)).await.is_err() {
                break;
            }
            delivered = record.cursor;
            self.frames_sent += 1;
            sent += 1;
            if sent % HISTORY_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        delivered
    }

    /// Replay journal records with cursor > `since`, up to `limit`.
    ///
    /// Returns `(sent, end_position, last_cursor_sent)` where `end_position`
    /// is the byte offset just past the last complete line examined.
    async fn replay(
        &mut self,
        since: u64,
        limit: usize,
        sink: &mpsc::Sender<Bytes>,
    ) -> (usize, u64, u64) {
        let path = self.paths.events_file(&self.session_id);
        let Ok(file) = File::open(&path).await else {
            return (0, 0, 0);
        };
        let len = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        let mut lines = BufReader::new(file).lines();
        let mut consumed: u64 = 0;
        let mut end_position: u64 = 0;
        let mut sent = 0usize;
        let mut last_cursor = 0u64;

        while let Ok(Some(line)) = lines.next_line().await {
            if sent >= limit {
                // History page is full; the suffix is delivered through the
                // live path so the client still sees a contiguous stream.
                break;
            }
            consumed += line.len() as u64 + 1;
            if consumed > len {
                // Torn tail: the final line has no newline yet
                break;
            }
            end_position = consumed;
            let Ok(record) = serde_json::from_str::<JournalRecord>(&line) else {
                continue;
            };
            if record.cursor <= since {
                continue;
            }
            if sink.send(sse::record_frame(&record)).await.is_err() {
                break;
            }
            last_cursor = record.cursor;
            sent += 1;
            self.frames_sent += 1;
            if sent % HISTORY_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        (sent, end_position, last_cursor)
    }

    /// Read newly appended complete lines and fan them out.
    ///
    /// Each client receives only records beyond its own cursor, so a
    /// duplicate poke (or an attach that re-read the suffix) never produces
    /// duplicate delivery.
    async fn read_live(&mut self) {
        let path = self.paths.events_file(&self.session_id);
        let Ok(mut file) = File::open(&path).await else {
            return;
        };
        let len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        if len <= self.position {
            return;
        }
        if file.seek(SeekFrom::Start(self.position)).await.is_err() {
            return;
        }
        let mut buf = Vec::with_capacity((len - self.position) as usize);
        if file.read_to_end(&mut buf).await.is_err() {
            return;
        }

        // Process only through the final newline; a torn tail stays unread
        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let complete = &buf[..=last_newline];
        let text = String::from_utf8_lossy(complete);

        let mut dead: Vec<u64> = Vec::new();
        for line in text.lines() {
            let Ok(record) = serde_json::from_str::<JournalRecord>(line) else {
                continue;
            };
            let frame = sse::record_frame(&record);
            for (id, client) in &mut self.clients {
                if record.cursor <= client.last_cursor {
                    continue;
                }
                match client.tx.try_send(frame.clone()) {
                    Ok(()) => {
                        client.last_cursor = record.cursor;
                        self.frames_sent += 1;
                    }
                    Err(_) => dead.push(*id),
                }
            }
            if !dead.is_empty() {
                for id in dead.drain(..) {
                    self.clients.remove(&id);
                    debug!("Tailer {}: client {id} dropped", self.session_id);
                }
            }
        }

        self.position += last_newline as u64 + 1;
        self.last_activity_at = now_ms();
    }

    /// Push a fresh `session_meta` snapshot to every client.
    async fn push_meta(&mut self) {
        if self.clients.is_empty() {
            return;
        }
        let sidecar = self.load_sidecar().await;
        let meta = self.engine.session_meta_for(&sidecar).await;
        let value = serde_json::to_value(&meta).unwrap_or_else(|_| json!({}));
        self.broadcast_raw(&sse::frame(None, "session_meta", &value));
    }

    /// Best-effort fan-out of a cursor-less frame; write failure drops the
    /// client, nothing else.
    fn broadcast_raw(&mut self, frame: &Bytes) {
        let mut dead: Vec<u64> = Vec::new();
        for (id, client) in &self.clients {
            if client.tx.try_send(frame.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            self.clients.remove(&id);
            debug!("Tailer {}: client {id} dropped", self.session_id);
        }
        self.frames_sent += 1;
    }
}

/// Channel capacity used for client sinks.
pub fn client_channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    mpsc::channel(CLIENT_BUFFER_FRAMES)
}

async fn idle_sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
