//! Core data model: sessions, meta, approvals and wire event shapes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Codex,
    Claude,
    Opencode,
    Kilocode,
    Custom,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "codex" => Some(Provider::Codex),
            "claude" => Some(Provider::Claude),
            "opencode" => Some(Provider::Opencode),
            "kilocode" => Some(Provider::Kilocode),
            "custom" => Some(Provider::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Codex => "codex",
            Provider::Claude => "claude",
            Provider::Opencode => "opencode",
            Provider::Kilocode => "kilocode",
            Provider::Custom => "custom",
        }
    }

    pub fn runtime(&self) -> RuntimeKind {
        match self {
            Provider::Codex => RuntimeKind::Codex,
            Provider::Claude => RuntimeKind::Claude,
            Provider::Opencode | Provider::Kilocode => RuntimeKind::OpenCodeServer,
            Provider::Custom => RuntimeKind::Custom,
        }
    }

    /// Source priority used by dedup tie-break: internal > unknown > codex.
    pub fn source_priority(source: &RecordSource) -> u8 {
        match source {
            RecordSource::Internal => 2,
            RecordSource::Unknown => 1,
            RecordSource::Codex => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Codex,
    Claude,
    OpenCodeServer,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Internal,
    Codex,
    Unknown,
}

/// Status state machine lattice (spec §4.4):
/// created -> starting -> running -> {exited, failed, killed}
///                      -> inactive -> {exited}     (NoProcess runtimes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Starting,
    Running,
    Inactive,
    Exited,
    Failed,
    Killed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Exited | Status::Failed | Status::Killed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Status::Starting | Status::Running)
    }

    /// Status priority used by dedup tie-break: active > inactive > terminal.
    pub fn priority(&self) -> u8 {
        if self.is_active() {
            2
        } else if *self == Status::Inactive || *self == Status::Created {
            1
        } else {
            0
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Inactive => "inactive",
            Status::Exited => "exited",
            Status::Failed => "failed",
            Status::Killed => "killed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub provider: Provider,
    pub cwd: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub status: Status,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exited_at: Option<chrono::DateTime<chrono::Utc>>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub title: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub workspace_id: Option<String>,
    pub worktree_id: Option<String>,
    pub thread_id: Option<String>,
    pub provider_session_id: Option<String>,
    pub last_turn_id: Option<String>,
    pub last_active_at: chrono::DateTime<chrono::Utc>,
    pub initial_input: Option<String>,
    pub runtime_options: RuntimeOptions,
    pub notification_overrides: HashMap<String, bool>,
    pub dismissed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub title_locked: bool,
    pub workflow_run_id: Option<String>,
}

impl SessionMeta {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            workspace_id: None,
            worktree_id: None,
            thread_id: None,
            provider_session_id: None,
            last_turn_id: None,
            last_active_at: chrono::Utc::now(),
            initial_input: None,
            runtime_options: RuntimeOptions::default(),
            notification_overrides: HashMap::new(),
            dismissed_at: None,
            title_locked: false,
            workflow_run_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: Session,
    pub source: RecordSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub session_id: String,
    pub request_id: u64,
    pub method: String,
    pub params: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Combined,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub stream: LogStream,
    pub chunk: String,
    pub ts: chrono::DateTime<chrono::Utc>,
}

impl LogEvent {
    pub fn new(stream: LogStream, chunk: String) -> Self {
        Self {
            kind: "log",
            stream,
            chunk,
            ts: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugEvent {
    pub seq: u64,
    pub session_id: String,
    pub stream: String,
    pub chunk: String,
    pub ts: chrono::DateTime<chrono::Utc>,
}

/// Provider-emitted structured conversation atom — opaque beyond `type`.
pub type Item = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexEvent {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub params: serde_json::Value,
}
