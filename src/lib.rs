#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! claude-gateway — single-host gateway for interactive coding-assistant
//! sessions.
//!
//! Exposes two provider flavors over HTTP/SSE/WebSocket:
//!
//! - **exec** — per-session FIFO turns over a JSON-line subprocess, with an
//!   append-only journal (`journal`), turn engine (`engine`), and SSE
//!   fan-out tailers (`tailer`).
//! - **shell** — long-lived interactive PTY sessions (`pty`) with history
//!   replay and multi-client fan-out.
//!
//! Everything persists under one gateway-owned root (default
//! `~/.claude-gateway`): one sidecar and one `.jsonl` journal per exec
//! session, so clients can reconnect, resume from a cursor, and replay
//! history.

pub mod auth;
pub mod config;
pub mod directory;
pub mod engine;
pub mod journal;
pub mod pty;
pub mod routes;
pub mod state;
pub mod tailer;
pub mod util;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use engine::ExecEngine;
pub use journal::JournalPaths;
pub use pty::PtyRegistry;
pub use state::AppState;
pub use tailer::TailerManager;
