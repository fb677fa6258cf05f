//! Exec-provider turn engine.
//!
//! Serializes user turns per session into child-process invocations of the
//! exec binary, transcodes its JSON-line stdout into journal events, and
//! exposes cancellation.
//!
//! ## Concurrency
//!
//! The session map is behind a `Mutex`; each session owns a FIFO `queue`, an
//! `active` flag (at most one running turn), and a shared
//! [`JournalWriter`] behind its own `Mutex` so user-message appends and the
//! running turn's appends serialize per record, never per turn. Turn
//! execution happens on a spawned task; `start_next_turn` re-schedules
//! itself after every finalize until the queue drains.

pub mod context;
pub mod provider;
pub mod slash;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::journal::event::{
    ContentBlock, ContentBlockEvent, EventData, MessageEnd, MessageStart, Role, SessionMeta,
    StopReason,
};
use crate::journal::writer::{JournalError, JournalWriter};
use crate::journal::{JournalPaths, SidecarPatch};
use crate::util::{now_ms, truncate_chars};

/// Stderr ring capacity in bytes.
const STDERR_RING_BYTES: usize = 8 * 1024;

/// Max characters of stderr included in a synthetic error block.
const STDERR_PREVIEW_CHARS: usize = 2000;

/// Sidecar preview length in characters.
const PREVIEW_CHARS: usize = 120;

/// Grace period between SIGTERM and SIGKILL when cancelling a child.
const KILL_GRACE_MS: u64 = 1500;

/// One queued user turn.
#[derive(Debug)]
struct Turn {
    prompt: String,
    content: String,
    user_message_id: String,
}

/// Handle for cancelling the currently-running turn.
#[derive(Clone)]
struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    pid: Arc<AtomicU32>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            pid: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// Per-session engine state.
#[derive(Default)]
struct SessionRuntime {
    queue: VecDeque<Turn>,
    active: bool,
    cancel: Option<CancelHandle>,
    writer: Option<Arc<Mutex<JournalWriter>>>,
}

/// Result of a `submit` call.
#[derive(Debug)]
pub struct SubmitReceipt {
    pub message_id: String,
}

/// Result of a `cancel` call.
#[derive(Debug, Clone, Copy)]
pub struct CancelOutcome {
    /// Whether this call newly cancelled a running turn.
    pub cancelled: bool,
    /// Whether a turn was running when the call arrived.
    pub running: bool,
    /// Whether queued turns were dropped.
    pub cleared_queue: bool,
}

/// Exec-provider turn engine. Cloneable; clones share all state.
#[derive(Clone)]
pub struct ExecEngine {
    paths: JournalPaths,
    config: Arc<Config>,
    sessions: Arc<Mutex<HashMap<String, SessionRuntime>>>,
    /// Session ids whose `session_meta` changed; tailers subscribe and push
    /// a fresh snapshot to their clients.
    meta_tx: broadcast::Sender<String>,
}

impl ExecEngine {
    pub fn new(paths: JournalPaths, config: Arc<Config>) -> Self {
        let (meta_tx, _) = broadcast::channel(256);
        Self {
            paths,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            meta_tx,
        }
    }

    /// Sender half of the meta-changed channel (for the tailer manager).
    pub fn meta_sender(&self) -> broadcast::Sender<String> {
        self.meta_tx.clone()
    }

    /// Live `(is_active, queue_length)` snapshot for a session.
    pub async fn snapshot(&self, session_id: &str) -> (bool, usize) {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .map_or((false, 0), |rt| (rt.active, rt.queue.len()))
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.snapshot(session_id).await.0
    }

    /// Build the `session_meta` payload for a session from its sidecar plus
    /// live engine state.
    pub async fn session_meta_for(
        &self,
        sidecar: &crate::journal::Sidecar,
    ) -> SessionMeta {
        let (is_active, queue_length) = self.snapshot(&sidecar.id).await;
        SessionMeta {
            provider: "exec".to_string(),
            session_id: sidecar.id.clone(),
            cwd: sidecar.cwd.clone(),
            model: sidecar.model.clone(),
            latest_thread_id: sidecar.latest_thread_id.clone(),
            usage: sidecar.usage,
            context_info: sidecar.context_info,
            is_active,
            queue_length,
        }
    }

    /// Get or open the session's shared journal writer.
    async fn writer_for(
        &self,
        session_id: &str,
    ) -> Result<Arc<Mutex<JournalWriter>>, JournalError> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(writer) = sessions.get(session_id).and_then(|rt| rt.writer.clone()) {
                return Ok(writer);
            }
        }
        let writer = Arc::new(Mutex::new(JournalWriter::open(&self.paths, session_id).await?));
        let mut sessions = self.sessions.lock().await;
        let rt = sessions.entry(session_id.to_string()).or_default();
        // A concurrent open may have won the race; keep the stored one.
        Ok(rt.writer.get_or_insert(writer).clone())
    }

    /// Submit a user message.
    ///
    /// Writes the user message triple and a sidecar commit, answers slash
    /// commands inline, otherwise queues a turn and schedules execution.
    pub async fn submit(
        &self,
        session_id: &str,
        content: &str,
        image_path: Option<&str>,
    ) -> Result<SubmitReceipt, JournalError> {
        let shared = self.writer_for(session_id).await?;

        let prompt = match image_path {
            Some(path) => format!("{content}\n\n[Attached image: {path}]"),
            None => content.to_string(),
        };
        let user_message_id = Uuid::new_v4().to_string();

        {
            let mut writer = shared.lock().await;
            append_message_triple(
                &mut writer,
                session_id,
                &user_message_id,
                Role::User,
                &prompt,
                StopReason::EndTurn,
            )
            .await?;
            let cursor = writer.cursor();
            writer
                .commit(SidecarPatch {
                    last_message_at: Some(now_ms()),
                    last_message_preview: Some(truncate_chars(content, PREVIEW_CHARS)),
                    message_count: Some(cursor),
                    ..SidecarPatch::default()
                })
                .await?;
        }

        if let Some(command) = slash::parse(content) {
            self.handle_slash(session_id, &shared, command).await?;
            self.notify_meta(session_id);
            return Ok(SubmitReceipt {
                message_id: user_message_id,
            });
        }

        {
            let mut sessions = self.sessions.lock().await;
            let rt = sessions.entry(session_id.to_string()).or_default();
            rt.queue.push_back(Turn {
                prompt,
                content: content.to_string(),
                user_message_id: user_message_id.clone(),
            });
            debug!(
                "Session {session_id}: queued turn ({} waiting)",
                rt.queue.len()
            );
        }
        self.notify_meta(session_id);

        let engine = self.clone();
        let id = session_id.to_string();
        tokio::spawn(async move {
            engine.start_next_turn(&id).await;
        });

        Ok(SubmitReceipt {
            message_id: user_message_id,
        })
    }

    /// Answer a slash command inline with an assistant message pair.
    ///
    /// Fires immediately even while a prior turn is running; the reply is
    /// visible in the journal at whatever cursor the append wins.
    async fn handle_slash(
        &self,
        session_id: &str,
        shared: &Arc<Mutex<JournalWriter>>,
        command: slash::SlashCommand,
    ) -> Result<(), JournalError> {
        let mut writer = shared.lock().await;
        let (reply, model_patch) = match command {
            slash::SlashCommand::ListModels => {
                let current = writer
                    .sidecar()
                    .model
                    .clone()
                    .or_else(|| self.config.exec.default_model.clone());
                (
                    slash::models_reply(&self.config.exec.model_choices, current.as_deref()),
                    None,
                )
            }
            slash::SlashCommand::SetModel(name) => {
                (slash::set_model_reply(&name), Some(name))
            }
        };

        let assistant_id = Uuid::new_v4().to_string();
        append_message_triple(
            &mut writer,
            session_id,
            &assistant_id,
            Role::Assistant,
            &reply,
            StopReason::EndTurn,
        )
        .await?;
        let cursor = writer.cursor();
        writer
            .commit(SidecarPatch {
                model: model_patch,
                last_message_at: Some(now_ms()),
                last_message_preview: Some(truncate_chars(&reply, PREVIEW_CHARS)),
                message_count: Some(cursor),
                ..SidecarPatch::default()
            })
            .await?;
        Ok(())
    }

    /// Run the next queued turn unless one is already active.
    fn start_next_turn<'a>(
        &'a self,
        session_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let (turn, handle) = {
            let mut sessions = self.sessions.lock().await;
            let Some(rt) = sessions.get_mut(session_id) else {
                return;
            };
            if rt.active {
                return;
            }
            let Some(turn) = rt.queue.pop_front() else {
                return;
            };
            rt.active = true;
            let handle = CancelHandle::new();
            rt.cancel = Some(handle.clone());
            (turn, handle)
        };

        let shared = match self.writer_for(session_id).await {
            Ok(shared) => shared,
            Err(e) => {
                error!("Session {session_id}: journal unavailable: {e}");
                self.release_turn(session_id).await;
                return;
            }
        };

        if let Err(e) = self.run_turn(session_id, &shared, turn, handle).await {
            error!("Session {session_id}: turn failed: {e}");
        }

        self.release_turn(session_id).await;
        self.notify_meta(session_id);

        let engine = self.clone();
        let id = session_id.to_string();
        tokio::spawn(async move {
            engine.start_next_turn(&id).await;
        });
        })
    }

    /// Execute one turn end-to-end: assistant `message_start`, child spawn,
    /// stdout transcoding, exactly-once finalize.
    async fn run_turn(
        &self,
        session_id: &str,
        shared: &Arc<Mutex<JournalWriter>>,
        turn: Turn,
        handle: CancelHandle,
    ) -> Result<(), JournalError> {
        let assistant_id = Uuid::new_v4().to_string();
        let model = {
            let mut writer = shared.lock().await;
            let model = writer
                .sidecar()
                .model
                .clone()
                .or_else(|| self.config.exec.default_model.clone());
            let line_number = writer.next_cursor();
            writer
                .append(&EventData::MessageStart(MessageStart {
                    id: assistant_id.clone(),
                    line_number,
                    role: Role::Assistant,
                    timestamp: now_ms(),
                    session_id: session_id.to_string(),
                }))
                .await?;
            model
        };

        let mut fin = Finalizer {
            session_id: session_id.to_string(),
            assistant_id,
            user_content: turn.content,
            model,
            blocks: 0,
            assistant_preview: None,
            thread_id: None,
            usage: None,
        };

        let bin = match which::which(&self.config.exec.bin) {
            Ok(path) => path,
            Err(_) => {
                warn!(
                    "Session {session_id}: exec binary {:?} not found",
                    self.config.exec.bin
                );
                let text = format!("Executable not found: {}", self.config.exec.bin);
                fin.push_text(shared, &text).await?;
                return fin.finish(shared, StopReason::Error).await;
            }
        };

        let cwd = {
            let writer = shared.lock().await;
            writer.sidecar().cwd.clone()
        };

        let mut cmd = Command::new(&bin);
        cmd.arg("-a")
            .arg(&self.config.exec.approval_policy)
            .arg("exec")
            .arg("--json")
            .arg("--skip-git-repo-check")
            .arg("-C")
            .arg(&cwd)
            .arg("--sandbox")
            .arg(&self.config.exec.sandbox_mode);
        if let Some(ref model) = fin.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg(&turn.prompt)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        // SAFETY: setpgid is async-signal-safe per POSIX. The child leads its
        // own process group so cancellation can signal the whole tree.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Session {session_id}: spawn failed: {e}");
                let text = format!("Failed to start {}: {e}", bin.display());
                fin.push_text(shared, &text).await?;
                return fin.finish(shared, StopReason::Error).await;
            }
        };

        let pid = child.id().unwrap_or(0);
        handle.pid.store(pid, Ordering::Relaxed);
        // A cancel that raced the spawn found pid 0; kill now that it exists
        if handle.cancelled.load(Ordering::Acquire) && pid > 0 {
            tokio::spawn(terminate_process_group(pid));
        }
        info!(
            "Session {session_id}: turn started (pid {pid}, message {})",
            fin.assistant_id
        );

        // Stderr ring — bounded, drop-oldest, consulted only on error.
        let stderr_ring = Arc::new(Mutex::new(ByteRing::new(STDERR_RING_BYTES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            let ring = Arc::clone(&stderr_ring);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut ring = ring.lock().await;
                    ring.push(line.as_bytes());
                    ring.push(b"\n");
                }
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match provider::transcode_line(&line) {
                    provider::ProviderSignal::ThreadStarted(id) => fin.thread_id = Some(id),
                    provider::ProviderSignal::TurnUsage(value) => {
                        fin.usage = Some(context::usage_from_value(&value));
                    }
                    provider::ProviderSignal::Block {
                        block,
                        assistant_text,
                    } => {
                        if let Some(text) = assistant_text {
                            fin.assistant_preview = Some(text);
                        }
                        fin.push_block(shared, block).await?;
                    }
                    provider::ProviderSignal::Ignored => {}
                }
            }
        }

        let status = child.wait().await;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let stop_reason = if handle.cancelled.load(Ordering::Acquire) {
            StopReason::Cancelled
        } else {
            match &status {
                Ok(status) if status.success() => StopReason::EndTurn,
                _ => StopReason::Error,
            }
        };

        if stop_reason == StopReason::Error {
            let code = status
                .as_ref()
                .ok()
                .and_then(std::process::ExitStatus::code);
            let preview = stderr_ring.lock().await.tail_chars(STDERR_PREVIEW_CHARS);
            let text = match code {
                Some(code) => format!("Exec provider exited with code {code}."),
                None => "Exec provider terminated by signal.".to_string(),
            };
            return fin
                .finish_error(shared, &text, preview)
                .await;
        }

        fin.finish(shared, stop_reason).await
    }

    /// Cancel the running turn and/or clear the queue.
    pub async fn cancel(&self, session_id: &str, clear_queue: bool) -> CancelOutcome {
        let (running, newly_cancelled, cleared, pid) = {
            let mut sessions = self.sessions.lock().await;
            let Some(rt) = sessions.get_mut(session_id) else {
                return CancelOutcome {
                    cancelled: false,
                    running: false,
                    cleared_queue: false,
                };
            };
            let cleared = if clear_queue && !rt.queue.is_empty() {
                rt.queue.clear();
                true
            } else {
                false
            };
            let running = rt.active;
            let (newly, pid) = match (&rt.cancel, running) {
                (Some(handle), true) => (
                    !handle.cancelled.swap(true, Ordering::AcqRel),
                    handle.pid.load(Ordering::Relaxed),
                ),
                _ => (false, 0),
            };
            (running, newly, cleared, pid)
        };

        if newly_cancelled && pid > 0 {
            info!("Session {session_id}: cancelling turn (pid {pid})");
            tokio::spawn(terminate_process_group(pid));
        }
        self.notify_meta(session_id);

        CancelOutcome {
            cancelled: newly_cancelled,
            running,
            cleared_queue: cleared,
        }
    }

    /// Kill all running children during shutdown.
    pub async fn shutdown_all(&self) {
        let sessions = self.sessions.lock().await;
        for (id, rt) in sessions.iter() {
            if let (true, Some(handle)) = (rt.active, &rt.cancel) {
                handle.cancelled.store(true, Ordering::Release);
                let pid = handle.pid.load(Ordering::Relaxed);
                if pid > 0 {
                    info!("Session {id}: SIGTERM sent (shutdown)");
                    #[allow(clippy::cast_possible_wrap)]
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGTERM);
                    }
                }
            }
        }
    }

    async fn release_turn(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(rt) = sessions.get_mut(session_id) {
            rt.active = false;
            rt.cancel = None;
        }
    }

    fn notify_meta(&self, session_id: &str) {
        let _ = self.meta_tx.send(session_id.to_string());
    }
}

/// Per-turn finalize state. `finish` runs exactly once; the turn task owns
/// this struct so double-finalize is unrepresentable.
struct Finalizer {
    session_id: String,
    assistant_id: String,
    user_content: String,
    model: Option<String>,
    blocks: u64,
    assistant_preview: Option<String>,
    thread_id: Option<String>,
    usage: Option<crate::journal::event::UsageSummary>,
}

impl Finalizer {
    async fn push_block(
        &mut self,
        shared: &Arc<Mutex<JournalWriter>>,
        block: ContentBlock,
    ) -> Result<(), JournalError> {
        let mut writer = shared.lock().await;
        writer
            .append(&EventData::ContentBlock(ContentBlockEvent {
                message_id: self.assistant_id.clone(),
                index: self.blocks,
                block,
            }))
            .await?;
        self.blocks += 1;
        Ok(())
    }

    async fn push_text(
        &mut self,
        shared: &Arc<Mutex<JournalWriter>>,
        text: &str,
    ) -> Result<(), JournalError> {
        self.push_block(
            shared,
            ContentBlock::Text {
                text: text.to_string(),
            },
        )
        .await
    }

    /// Error finalize: synthesize a descriptive block when nothing was
    /// emitted, otherwise append the stderr preview as an extra block.
    async fn finish_error(
        mut self,
        shared: &Arc<Mutex<JournalWriter>>,
        summary: &str,
        stderr_preview: String,
    ) -> Result<(), JournalError> {
        if self.blocks == 0 {
            let text = if stderr_preview.is_empty() {
                summary.to_string()
            } else {
                format!("{summary}\n\n{stderr_preview}")
            };
            self.push_text(shared, &text).await?;
        } else if !stderr_preview.is_empty() {
            self.push_text(shared, &stderr_preview).await?;
        }
        self.finish(shared, StopReason::Error).await
    }

    /// Terminal step of every turn: `message_end`, usage/context accounting,
    /// sidecar commit.
    async fn finish(
        mut self,
        shared: &Arc<Mutex<JournalWriter>>,
        stop_reason: StopReason,
    ) -> Result<(), JournalError> {
        if stop_reason == StopReason::Cancelled && self.blocks == 0 {
            self.push_text(shared, "Cancelled.").await?;
        }

        let mut writer = shared.lock().await;
        writer
            .append(&EventData::MessageEnd(MessageEnd {
                id: self.assistant_id.clone(),
                stop_reason,
            }))
            .await?;

        let context_info = self
            .usage
            .map(|usage| context::context_info(self.model.as_deref(), usage.total_tokens));
        let preview = self
            .assistant_preview
            .as_deref()
            .unwrap_or(&self.user_content);
        let cursor = writer.cursor();
        writer
            .commit(SidecarPatch {
                model: self.model.clone(),
                last_message_at: Some(now_ms()),
                last_message_preview: Some(truncate_chars(preview, PREVIEW_CHARS)),
                message_count: Some(cursor),
                latest_thread_id: self.thread_id.clone(),
                usage: self.usage,
                context_info,
            })
            .await?;

        info!(
            "Session {}: turn finished ({:?}, cursor {cursor})",
            self.session_id, stop_reason
        );
        Ok(())
    }
}

/// SIGTERM the process group, wait the grace period, SIGKILL if still alive.
async fn terminate_process_group(pid: u32) {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pid as i32;
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    tokio::time::sleep(tokio::time::Duration::from_millis(KILL_GRACE_MS)).await;
    let alive = unsafe { libc::kill(pgid, 0) } == 0;
    if alive {
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
        warn!("Process group {pid} required SIGKILL");
    }
}

/// Bounded byte ring that drops its oldest contents on overflow.
struct ByteRing {
    buf: VecDeque<u8>,
    cap: usize,
}

impl ByteRing {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    /// Last ≤`max` characters of the ring as lossy UTF-8.
    fn tail_chars(&self, max: usize) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        let text = String::from_utf8_lossy(&bytes);
        let text = text.trim_end();
        let count = text.chars().count();
        if count <= max {
            text.to_string()
        } else {
            text.chars().skip(count - max).collect()
        }
    }
}

/// Append a complete `message_start` / text `content_block` / `message_end`
/// triple for one message.
async fn append_message_triple(
    writer: &mut JournalWriter,
    session_id: &str,
    message_id: &str,
    role: Role,
    text: &str,
    stop_reason: StopReason,
) -> Result<(), JournalError> {
    writer
        .append(&EventData::MessageStart(MessageStart {
            id: message_id.to_string(),
            line_number: writer.next_cursor(),
            role,
            timestamp: now_ms(),
            session_id: session_id.to_string(),
        }))
        .await?;
    writer
        .append(&EventData::ContentBlock(ContentBlockEvent {
            message_id: message_id.to_string(),
            index: 0,
            block: ContentBlock::Text {
                text: text.to_string(),
            },
        }))
        .await?;
    writer
        .append(&EventData::MessageEnd(MessageEnd {
            id: message_id.to_string(),
            stop_reason,
        }))
        .await?;
    Ok(())
}
