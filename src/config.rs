//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `GATEWAY_API_KEY`, `GATEWAY_LISTEN`,
//!    `GATEWAY_ROOT`, `GATEWAY_WORKDIR`, `GATEWAY_EXEC_BIN`,
//!    `GATEWAY_MUXER`, `GATEWAY_BOOT_CMD`
//! 2. **Config file** — path via `--config <path>`, or `gateway.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8787"
//! root_dir = "~/.claude-gateway"
//! workdir = "~"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [exec]
//! bin = "codex"
//! approval_policy = "never"
//! sandbox_mode = "workspace-write"
//! default_model = "gpt-5.2-codex"
//! model_choices = ["gpt-5.2-codex", "o3", "o4-mini", "gpt-4o"]
//!
//! [terminal]
//! shell = "/bin/bash"
//! # muxer_bin = "tmux"
//! # boot_cmd = "claude"
//! history_limit = 200000
//! session_ttl_ms = 14400000
//! idle_timeout_ms = 1800000
//!
//! [stream]
//! heartbeat_interval_ms = 15000
//! tailer_idle_ms = 60000
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and filesystem-root settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8787`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent TCP connections (default 64).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Root directory for sidecars and journals (default `~/.claude-gateway`).
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    /// Default working directory for new sessions (default `~`).
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `GATEWAY_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Exec-provider (JSON-line subprocess) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    /// Exec-provider binary (default `codex`).
    #[serde(default = "default_exec_bin")]
    pub bin: String,
    /// Value passed via `-a` (default `never`).
    #[serde(default = "default_approval_policy")]
    pub approval_policy: String,
    /// Value passed via `--sandbox` (default `workspace-write`).
    #[serde(default = "default_sandbox_mode")]
    pub sandbox_mode: String,
    /// Initial model for new sessions. `None` uses the binary's default.
    pub default_model: Option<String>,
    /// Models offered by the `/models` slash command.
    #[serde(default = "default_model_choices")]
    pub model_choices: Vec<String>,
}

/// PTY terminal provider settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Login shell to spawn when no muxer is configured. `None` uses `$SHELL`
    /// falling back to `/bin/bash`.
    pub shell: Option<String>,
    /// Process muxer binary (e.g. `tmux`). When set, terminals are spawned as
    /// `<muxer> -A -s <id>` so reconnects attach to the same backend session.
    pub muxer_bin: Option<String>,
    /// Command written to the PTY (with a trailing `\r`) 200 ms after spawn.
    pub boot_cmd: Option<String>,
    /// History buffer cap in bytes (default 200,000).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Hard session lifetime in milliseconds (default 4 h).
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    /// Zero-client idle timeout in milliseconds (default 30 min).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Reaper sweep interval in milliseconds (default 5 min).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Journal tailer / SSE fan-out settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// SSE heartbeat cadence in milliseconds (default 15 s).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long a tailer survives with zero clients (default 60 s).
    #[serde(default = "default_tailer_idle_ms")]
    pub tailer_idle_ms: u64,
    /// Stability window coalescing journal-change notifications (default 100 ms).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Default history page size when the client omits `limit`.
    #[serde(default = "default_history_limit_records")]
    pub history_limit_records: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8787".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_root_dir() -> String {
    "~/.claude-gateway".to_string()
}
fn default_workdir() -> String {
    "~".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_exec_bin() -> String {
    "codex".to_string()
}
fn default_approval_policy() -> String {
    "never".to_string()
}
fn default_sandbox_mode() -> String {
    "workspace-write".to_string()
}
fn default_model_choices() -> Vec<String> {
    vec![
        "gpt-5.2-codex".to_string(),
        "o3".to_string(),
        "o4-mini".to_string(),
        "gpt-4o".to_string(),
    ]
}
fn default_history_limit() -> usize {
    200_000
}
fn default_session_ttl_ms() -> u64 {
    4 * 60 * 60 * 1000
}
fn default_idle_timeout_ms() -> u64 {
    30 * 60 * 1000
}
fn default_sweep_interval_ms() -> u64 {
    5 * 60 * 1000
}
fn default_heartbeat_interval_ms() -> u64 {
    15_000
}
fn default_tailer_idle_ms() -> u64 {
    60_000
}
fn default_debounce_ms() -> u64 {
    100
}
fn default_history_limit_records() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            root_dir: default_root_dir(),
            workdir: default_workdir(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            bin: default_exec_bin(),
            approval_policy: default_approval_policy(),
            sandbox_mode: default_sandbox_mode(),
            default_model: None,
            model_choices: default_model_choices(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: None,
            muxer_bin: None,
            boot_cmd: None,
            history_limit: default_history_limit(),
            session_ttl_ms: default_session_ttl_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            tailer_idle_ms: default_tailer_idle_ms(),
            debounce_ms: default_debounce_ms(),
            history_limit_records: default_history_limit_records(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            exec: ExecConfig::default(),
            terminal: TerminalConfig::default(),
            stream: StreamConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `gateway.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("gateway.toml").exists() {
            let content =
                std::fs::read_to_string("gateway.toml").expect("Failed to read gateway.toml");
            toml::from_str(&content).expect("Failed to parse gateway.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("GATEWAY_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("GATEWAY_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(root) = std::env::var("GATEWAY_ROOT") {
            config.server.root_dir = root;
        }
        if let Ok(workdir) = std::env::var("GATEWAY_WORKDIR") {
            config.server.workdir = workdir;
        }
        if let Ok(bin) = std::env::var("GATEWAY_EXEC_BIN") {
            config.exec.bin = bin;
        }
        if let Ok(muxer) = std::env::var("GATEWAY_MUXER") {
            config.terminal.muxer_bin = Some(muxer);
        }
        if let Ok(cmd) = std::env::var("GATEWAY_BOOT_CMD") {
            config.terminal.boot_cmd = Some(cmd);
        }

        config
    }

    /// Shell binary for new terminals: config, then `$SHELL`, then `/bin/bash`.
    pub fn terminal_shell(&self) -> String {
        self.terminal
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/bash".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.terminal.history_limit, 200_000);
        assert_eq!(config.terminal.session_ttl_ms, 4 * 60 * 60 * 1000);
        assert_eq!(config.terminal.idle_timeout_ms, 30 * 60 * 1000);
        assert_eq!(config.stream.heartbeat_interval_ms, 15_000);
        assert_eq!(config.stream.tailer_idle_ms, 60_000);
        assert_eq!(config.exec.bin, "codex");
        assert_eq!(config.exec.approval_policy, "never");
        assert_eq!(config.exec.sandbox_mode, "workspace-write");
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [terminal]
            muxer_bin = "tmux"
            history_limit = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.terminal.muxer_bin.as_deref(), Some("tmux"));
        assert_eq!(config.terminal.history_limit, 1000);
        // Untouched sections keep defaults
        assert_eq!(config.server.listen, "0.0.0.0:8787");
        assert_eq!(config.exec.bin, "codex");
    }
}
