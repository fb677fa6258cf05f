//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::engine::ExecEngine;
use crate::journal::JournalPaths;
use crate::pty::PtyRegistry;
use crate::tailer::TailerManager;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Resolved journal/sidecar locations under the gateway root.
    pub paths: JournalPaths,
    /// Exec-provider turn engine.
    pub engine: ExecEngine,
    /// Interactive PTY terminal registry.
    pub terminals: PtyRegistry,
    /// Per-session journal tailers for SSE fan-out.
    pub tailers: TailerManager,
}

impl AppState {
    /// Build the full state graph from a loaded config and resolved root.
    pub fn new(config: Arc<Config>, paths: JournalPaths) -> Self {
        let engine = ExecEngine::new(paths.clone(), Arc::clone(&config));
        let terminals = PtyRegistry::new(Arc::clone(&config));
        let tailers = TailerManager::new(paths.clone(), engine.clone(), &config);
        Self {
            config,
            start_time: Instant::now(),
            paths,
            engine,
            terminals,
            tailers,
        }
    }
}
