//! Exec-session directory: enumeration and creation.
//!
//! Sessions are whatever sidecar files exist under `codex-sessions/`;
//! listing stats the directory fresh on every call rather than trusting any
//! in-memory registry, so sessions created by a previous process generation
//! appear too.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::ExecEngine;
use crate::journal::{JournalPaths, Sidecar};
use crate::util::{expand_tilde, now_ms};

/// Default page size for `GET /api/sessions`.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// One row of the session listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    #[serde(flatten)]
    pub sidecar: Sidecar,
    /// Journal size in bytes (0 when the journal doesn't exist yet).
    pub file_size: u64,
    /// Whether the engine is currently running a turn for this session.
    pub is_active: bool,
}

/// A page of the session listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    pub sessions: Vec<SessionEntry>,
    pub total: usize,
    pub has_more: bool,
}

/// Errors from session creation.
#[derive(Debug)]
pub enum CreateError {
    /// The requested working directory does not exist.
    InvalidCwd(String),
    Io(std::io::Error),
}

impl std::fmt::Display for CreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCwd(cwd) => write!(f, "Working directory does not exist: {cwd}"),
            Self::Io(e) => write!(f, "Session create failed: {e}"),
        }
    }
}

impl From<std::io::Error> for CreateError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// List sessions newest-first by sidecar mtime, with offset/limit paging.
///
/// A sidecar that fails to parse still appears (as an empty record carrying
/// its id) — a corrupt file must not hide the session from the client.
pub async fn list_sessions(
    paths: &JournalPaths,
    engine: &ExecEngine,
    offset: usize,
    limit: usize,
) -> SessionPage {
    let mut candidates: Vec<(PathBuf, String, SystemTime)> = Vec::new();
    if let Ok(mut read_dir) = fs::read_dir(paths.sessions_dir()).await {
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let mtime = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((path, id, mtime));
        }
    }

    candidates.sort_by(|a, b| b.2.cmp(&a.2));
    let total = candidates.len();
    let has_more = offset + limit < total;

    let mut sessions = Vec::new();
    for (path, id, _) in candidates.into_iter().skip(offset).take(limit) {
        let mut sidecar = match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<serde_json::Value>(&raw)
                .map(|v| Sidecar::from_json_lenient(&v))
                .unwrap_or_default(),
            Err(e) => {
                warn!("Failed to read sidecar {}: {e}", path.display());
                Sidecar::default()
            }
        };
        if sidecar.id.is_empty() {
            sidecar.id = id.clone();
        }
        let file_size = fs::metadata(paths.events_file(&id))
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let is_active = engine.is_active(&id).await;
        sessions.push(SessionEntry {
            sidecar,
            file_size,
            is_active,
        });
    }

    SessionPage {
        sessions,
        total,
        has_more,
    }
}

/// Create a new exec session: validate the working directory, mint an id,
/// write the sidecar, and touch an empty journal.
pub async fn create_session(
    paths: &JournalPaths,
    config: &Config,
    cwd: Option<&str>,
    model: Option<&str>,
) -> Result<Sidecar, CreateError> {
    let requested = cwd.unwrap_or(&config.server.workdir);
    let resolved = expand_tilde(requested).into_owned();
    match fs::metadata(&resolved).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(CreateError::InvalidCwd(resolved)),
    }

    let sidecar = Sidecar {
        id: Uuid::new_v4().to_string(),
        cwd: resolved,
        model: model
            .map(String::from)
            .or_else(|| config.exec.default_model.clone()),
        created_at: now_ms(),
        last_cursor: Some(0),
        ..Sidecar::default()
    };

    let body = serde_json::to_vec(&sidecar).map_err(std::io::Error::other)?;
    fs::write(paths.sidecar_file(&sidecar.id), body).await?;
    // Touch the journal so tailers and the directory can stat it right away
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.events_file(&sidecar.id))
        .await?;

    info!("Session {} created (cwd: {})", sidecar.id, sidecar.cwd);
    Ok(sidecar)
}
