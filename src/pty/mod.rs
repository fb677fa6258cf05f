//! PTY session registry.
//!
//! [`PtyRegistry`] is the single authority for the pool of interactive
//! terminal sessions: get-or-create by id, raw input, resize, client
//! fan-out with a bounded history prefix, and lifecycle enforcement.
//!
//! Terminal sessions are ephemeral — nothing is journaled. Output flows from
//! the PTY master into a byte-capped history ring and out to every attached
//! client; a client attaching later receives the surviving history first.
//!
//! ## Concurrency
//!
//! The registry map is behind an `RwLock`. Per-session mutable state
//! (clients, history, activity clock) lives in one `Mutex` shared with the
//! reader task. `get_or_create` holds the write lock across the
//! check-and-insert to prevent duplicate spawns.

pub mod spawn;

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::util::expand_tilde;

/// Initial terminal geometry.
const INITIAL_COLS: u16 = 120;
const INITIAL_ROWS: u16 = 40;

/// Delay before the boot command is written to a fresh PTY.
const BOOT_CMD_DELAY_MS: u64 = 200;

/// Per-client frame buffer; a client this far behind is dropped.
const CLIENT_BUFFER_FRAMES: usize = 256;

/// Frames delivered to attached terminal clients.
#[derive(Debug, Clone)]
pub enum PtyFrame {
    /// A chunk of terminal output (lossy UTF-8).
    Data(String),
    /// The PTY process exited; no more data will follow.
    Exit,
}

/// Byte-capped FIFO of output chunks. Whole chunks are evicted from the
/// front on overflow, so the surviving suffix is never cut mid-frame.
pub struct HistoryBuffer {
    chunks: VecDeque<String>,
    bytes: usize,
    cap: usize,
}

impl HistoryBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            cap,
        }
    }

    pub fn push(&mut self, chunk: String) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.bytes > self.cap {
            match self.chunks.pop_front() {
                Some(old) => self.bytes -= old.len(),
                None => break,
            }
        }
    }

    /// Concatenated surviving history.
    pub fn snapshot(&self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for chunk in &self.chunks {
            out.push_str(chunk);
        }
        out
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }
}

struct PtyShared {
    clients: HashMap<u64, mpsc::Sender<PtyFrame>>,
    next_client_id: u64,
    history: HistoryBuffer,
    last_activity: Instant,
}

/// One live terminal session.
pub struct PtySession {
    pub id: String,
    pub pid: u32,
    pub created_at: u64,
    created: Instant,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    pty_master: OwnedFd,
    exited: Arc<AtomicBool>,
    shared: Arc<Mutex<PtyShared>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl PtySession {
    /// Send raw bytes to the terminal.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), String> {
        self.shared.lock().await.last_activity = Instant::now();
        self.stdin_tx
            .send(data)
            .await
            .map_err(|_| "Terminal input closed".to_string())
    }

    /// Resize the terminal. Dimensions must be strictly positive.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), String> {
        if cols == 0 || rows == 0 {
            return Err("Terminal dimensions must be positive".to_string());
        }
        spawn::resize_pty(&self.pty_master, rows, cols).map_err(|e| e.to_string())
    }

    /// Register a sink: it immediately receives the history prefix, then
    /// every subsequent output chunk. Returns the sink id for `detach`.
    pub async fn attach(&self, sink: mpsc::Sender<PtyFrame>) -> u64 {
        let mut shared = self.shared.lock().await;
        let prefix = shared.history.snapshot();
        if !prefix.is_empty() {
            let _ = sink.try_send(PtyFrame::Data(prefix));
        }
        if self.exited.load(Ordering::Acquire) {
            let _ = sink.try_send(PtyFrame::Exit);
        }
        let id = shared.next_client_id;
        shared.next_client_id += 1;
        shared.clients.insert(id, sink);
        shared.last_activity = Instant::now();
        id
    }

    pub async fn detach(&self, sink_id: u64) {
        let mut shared = self.shared.lock().await;
        shared.clients.remove(&sink_id);
        shared.last_activity = Instant::now();
    }

    pub async fn client_count(&self) -> usize {
        self.shared.lock().await.clients.len()
    }

    fn send_signal_group(&self, signal: i32) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            unsafe {
                libc::kill(-pgid, signal);
            }
        }
    }

    /// SIGTERM the process group, wait up to 3 s for exit, then SIGKILL.
    async fn graceful_kill(&self) {
        self.send_signal_group(libc::SIGTERM);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !self.exited.load(Ordering::Acquire) {
            if tokio::time::Instant::now() >= deadline {
                self.send_signal_group(libc::SIGKILL);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

type SessionMap = Arc<RwLock<HashMap<String, Arc<PtySession>>>>;

/// Manages the pool of live terminal sessions.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct PtyRegistry {
    sessions: SessionMap,
    config: Arc<Config>,
}

impl PtyRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Return the session for `id`, spawning it if absent.
    ///
    /// New sessions prefer the configured process muxer (attach-or-create
    /// semantics) over a bare login shell, run at 120×40 with
    /// `TERM=xterm-256color`, and receive the configured boot command 200 ms
    /// after spawn.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<PtySession>, String> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                session.shared.lock().await.last_activity = Instant::now();
                return Ok(Arc::clone(session));
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check: another task may have spawned while we waited
        if let Some(session) = sessions.get(id) {
            return Ok(Arc::clone(session));
        }

        let session = self.spawn_session(id).await?;
        sessions.insert(id.to_string(), Arc::clone(&session));
        info!(
            "Terminal {id} created (pid {}, total: {})",
            session.pid,
            sessions.len()
        );
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn spawn_session(&self, id: &str) -> Result<Arc<PtySession>, String> {
        let pty_pair = spawn::allocate_pty(INITIAL_ROWS, INITIAL_COLS)
            .map_err(|e| format!("Failed to allocate PTY: {e}"))?;

        let argv = match self.config.terminal.muxer_bin {
            Some(ref muxer) => vec![
                muxer.clone(),
                "-A".to_string(),
                "-s".to_string(),
                id.to_string(),
            ],
            None => vec![self.config.terminal_shell(), "-l".to_string()],
        };

        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        let workdir = expand_tilde(&self.config.server.workdir).into_owned();

        let mut child = spawn::spawn_terminal(&pty_pair, &argv, &workdir, &env)
            .map_err(|e| format!("Failed to spawn terminal: {e}"))?;
        let pid = child.id().unwrap_or(0);

        let shared = Arc::new(Mutex::new(PtyShared {
            clients: HashMap::new(),
            next_client_id: 1,
            history: HistoryBuffer::new(self.config.terminal.history_limit),
            last_activity: Instant::now(),
        }));
        let exited = Arc::new(AtomicBool::new(false));

        let master_raw: RawFd = pty_pair.master.as_raw_fd();
        // Dup the master: one fd to write, one to read; the original stays
        // alive for resize.
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(format!(
                "dup() failed for PTY master writer: {}",
                std::io::Error::last_os_error()
            ));
        }
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            unsafe {
                libc::close(writer_fd);
            }
            return Err(format!(
                "dup() failed for PTY master reader: {}",
                std::io::Error::last_os_error()
            ));
        }
        // SAFETY: we own these file descriptors via dup
        let master_write =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let master_read =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        // stdin writer task: mpsc → PTY master
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_task = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = stdin_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Output reader task: PTY master → history + fan-out
        let sid_out = id.to_string();
        let shared_out = Arc::clone(&shared);
        let output_task = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&tmp[..n]).into_owned();
                        let mut shared = shared_out.lock().await;
                        shared.history.push(data.clone());
                        let mut dead: Vec<u64> = Vec::new();
                        for (client_id, sink) in &shared.clients {
                            if sink.try_send(PtyFrame::Data(data.clone())).is_err() {
                                dead.push(*client_id);
                            }
                        }
                        for client_id in dead {
                            shared.clients.remove(&client_id);
                            debug!("Terminal {sid_out}: client {client_id} dropped");
                        }
                    }
                }
            }
            debug!("Terminal {sid_out}: PTY output closed");
        });

        // Exit watcher: notify sinks, mark exited, remove from the registry
        let sid_exit = id.to_string();
        let shared_exit = Arc::clone(&shared);
        let exited_exit = Arc::clone(&exited);
        let map_exit = Arc::clone(&self.sessions);
        let exit_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("Terminal {sid_exit} exited ({status})"),
                Err(e) => warn!("Terminal {sid_exit} wait error: {e}"),
            }
            exited_exit.store(true, Ordering::Release);
            {
                let shared = shared_exit.lock().await;
                for sink in shared.clients.values() {
                    let _ = sink.try_send(PtyFrame::Exit);
                }
            }
            map_exit.write().await.remove(&sid_exit);
        });

        let mut tasks = vec![stdin_task, output_task, exit_task];

        // Boot command, written shortly after the shell is up
        if let Some(ref boot_cmd) = self.config.terminal.boot_cmd {
            let line = format!("{boot_cmd}\r");
            let boot_tx = stdin_tx.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(BOOT_CMD_DELAY_MS)).await;
                let _ = boot_tx.send(line.into_bytes()).await;
            }));
        }

        Ok(Arc::new(PtySession {
            id: id.to_string(),
            pid,
            created_at: crate::util::now_ms(),
            created: Instant::now(),
            stdin_tx,
            pty_master: pty_pair.master,
            exited,
            shared,
            tasks,
        }))
    }

    /// Periodic sweep enforcing the lifecycle policy:
    ///
    /// 1. **Exited sessions** — process already dead, entry removed.
    /// 2. **TTL** — sessions older than `session_ttl_ms`.
    /// 3. **Idle** — zero clients for longer than `idle_timeout_ms`.
    ///
    /// Expired sessions are killed gracefully outside the map lock.
    pub async fn sweep(&self) {
        let ttl = Duration::from_millis(self.config.terminal.session_ttl_ms);
        let idle = Duration::from_millis(self.config.terminal.idle_timeout_ms);

        let mut expired: Vec<Arc<PtySession>> = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            let mut doomed: Vec<String> = Vec::new();
            for (id, session) in sessions.iter() {
                if session.exited.load(Ordering::Acquire) {
                    doomed.push(id.clone());
                    continue;
                }
                let shared = session.shared.lock().await;
                if should_reap(
                    session.created.elapsed(),
                    shared.last_activity.elapsed(),
                    shared.clients.len(),
                    ttl,
                    idle,
                ) {
                    doomed.push(id.clone());
                }
            }
            for id in doomed {
                if let Some(session) = sessions.remove(&id) {
                    info!("Terminal {id}: reaped");
                    expired.push(session);
                }
            }
        }

        for session in expired {
            for sink in session.shared.lock().await.clients.values() {
                let _ = sink.try_send(PtyFrame::Exit);
            }
            session.graceful_kill().await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Kill every session (shutdown): SIGTERM all, wait up to 3 s, SIGKILL
    /// the rest.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<PtySession>> = {
            let mut map = self.sessions.write().await;
            map.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return;
        }

        for session in &sessions {
            session.send_signal_group(libc::SIGTERM);
            info!("Terminal {}: SIGTERM sent (shutdown)", session.id);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let all_exited = sessions
                .iter()
                .all(|s| s.exited.load(Ordering::Acquire));
            if all_exited || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for session in &sessions {
            if !session.exited.load(Ordering::Acquire) {
                session.send_signal_group(libc::SIGKILL);
            }
            for task in &session.tasks {
                task.abort();
            }
        }
        info!("Shut down {} terminal(s)", sessions.len());
    }
}

/// Channel pair for a terminal client sink.
pub fn client_channel() -> (mpsc::Sender<PtyFrame>, mpsc::Receiver<PtyFrame>) {
    mpsc::channel(CLIENT_BUFFER_FRAMES)
}

/// Lifecycle policy predicate, shared by the sweep.
fn should_reap(
    age: Duration,
    inactive: Duration,
    clients: usize,
    ttl: Duration,
    idle: Duration,
) -> bool {
    age > ttl || (clients == 0 && inactive > idle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_caps_bytes() {
        let mut history = HistoryBuffer::new(10);
        history.push("aaaa".to_string());
        history.push("bbbb".to_string());
        history.push("cccc".to_string());
        assert!(history.len_bytes() <= 10);
        // Oldest chunk evicted whole; the tail survives intact
        assert_eq!(history.snapshot(), "bbbbcccc");
    }

    #[test]
    fn test_history_single_oversized_chunk() {
        let mut history = HistoryBuffer::new(4);
        history.push("0123456789".to_string());
        // A lone chunk larger than the cap is dropped entirely
        assert_eq!(history.snapshot(), "");
        history.push("ok".to_string());
        assert_eq!(history.snapshot(), "ok");
    }

    #[test]
    fn test_history_preserves_order() {
        let mut history = HistoryBuffer::new(1000);
        for i in 0..5 {
            history.push(format!("{i};"));
        }
        assert_eq!(history.snapshot(), "0;1;2;3;4;");
    }

    #[test]
    fn test_reap_policy() {
        let ttl = Duration::from_secs(4 * 60 * 60);
        let idle = Duration::from_secs(30 * 60);
        // Fresh, attached: keep
        assert!(!should_reap(
            Duration::from_secs(60),
            Duration::from_secs(1),
            1,
            ttl,
            idle
        ));
        // Past TTL: reap even with clients
        assert!(should_reap(
            Duration::from_secs(5 * 60 * 60),
            Duration::from_secs(1),
            3,
            ttl,
            idle
        ));
        // Zero clients, long idle: reap
        assert!(should_reap(
            Duration::from_secs(60),
            Duration::from_secs(31 * 60),
            0,
            ttl,
            idle
        ));
        // Zero clients but recently active: keep
        assert!(!should_reap(
            Duration::from_secs(60),
            Duration::from_secs(60),
            0,
            ttl,
            idle
        ));
        // Idle but a client is attached: keep
        assert!(!should_reap(
            Duration::from_secs(60),
            Duration::from_secs(31 * 60),
            1,
            ttl,
            idle
        ));
    }
}
