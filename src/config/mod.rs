use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_MAX_SESSIONS: usize = 10;
const DEFAULT_LOG_BUFFER_BYTES: usize = 1024 * 1024;
const DEFAULT_DEBUG_BUFFER_LEN: usize = 2048;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 150;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// Per-provider configuration profile, parsed from TOML sections like
/// `[provider.claude]`, `[provider.codex]`, `[provider.opencode]`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProviderProfile {
    /// Request/spawn timeout in seconds (provider-specific default).
    pub timeout: Option<u64>,
    /// Overrides the executable/command invoked for local providers.
    pub cmd_override: Option<String>,
    /// Base URL for remote (HTTP+SSE) providers.
    pub base_url: Option<String>,
    /// Env var name carrying a bearer token for remote providers.
    pub bearer_env: Option<String>,
    /// Env var name carrying HTTP basic-auth credentials (`user:pass`).
    pub basic_env: Option<String>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var > TOML > built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    max_sessions: Option<usize>,
    log: Option<String>,
    log_buffer_bytes: Option<usize>,
    debug_buffer_len: Option<usize>,
    flush_interval_ms: Option<u64>,
    provider: Option<HashMap<String, ProviderProfile>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Maximum concurrent sessions; 0 = unlimited.
    pub max_sessions: usize,
    /// Byte bound for each session's `LogBuffer` (§C1).
    pub log_buffer_bytes: usize,
    /// Retained-history bound for each session's `DebugBuffer` (§C1).
    pub debug_buffer_len: usize,
    /// Supervisor flush tick interval, milliseconds (§C4).
    pub flush_interval_ms: u64,
    pub providers: HashMap<String, ProviderProfile>,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest): CLI/env (`Some(value)` from clap) >
    /// TOML file at `{data_dir}/config.toml` > built-in defaults.
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        max_sessions: Option<usize>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let max_sessions = max_sessions
            .or(toml.max_sessions)
            .unwrap_or(DEFAULT_MAX_SESSIONS);
        let log_buffer_bytes = toml.log_buffer_bytes.unwrap_or(DEFAULT_LOG_BUFFER_BYTES);
        let debug_buffer_len = toml.debug_buffer_len.unwrap_or(DEFAULT_DEBUG_BUFFER_LEN);
        let flush_interval_ms = toml.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS);
        let providers = toml.provider.unwrap_or_default();

        Self {
            port,
            data_dir,
            log,
            max_sessions,
            log_buffer_bytes,
            debug_buffer_len,
            flush_interval_ms,
            providers,
        }
    }

    /// Get the provider profile for a specific provider name, if configured.
    pub fn provider_profile(&self, name: &str) -> Option<&ProviderProfile> {
        self.providers.get(name)
    }
}

/// Resolves the codex home directory for a session per spec §4.5: an
/// `ARCHON_CODEX_HOME` env override, else `<cwd>/.archon`, else
/// `<workspace_root>/.archon`, created on first use.
pub fn codex_home(cwd: &Path, workspace_root: Option<&Path>) -> std::io::Result<PathBuf> {
    if let Ok(over) = std::env::var("ARCHON_CODEX_HOME") {
        let path = PathBuf::from(over);
        std::fs::create_dir_all(&path)?;
        return Ok(path);
    }
    let candidate = cwd.join(".archon");
    if candidate.is_dir() {
        return Ok(candidate);
    }
    let path = match workspace_root {
        Some(root) => root.join(".archon"),
        None => candidate,
    };
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("archon");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("archon");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("archon");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("archon");
        }
    }
    PathBuf::from(".archon-data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codex_home_prefers_existing_cwd_dotdir() {
        let dir = tempfile::tempdir().unwrap();
        let cwd_dotdir = dir.path().join(".archon");
        std::fs::create_dir_all(&cwd_dotdir).unwrap();
        let resolved = codex_home(dir.path(), None).unwrap();
        assert_eq!(resolved, cwd_dotdir);
    }

    #[test]
    fn codex_home_falls_back_to_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("repo");
        std::fs::create_dir_all(&cwd).unwrap();
        let resolved = codex_home(&cwd, Some(dir.path())).unwrap();
        assert_eq!(resolved, dir.path().join(".archon"));
        assert!(resolved.is_dir());
    }
}
