//! Provider runtimes (C3): launch or attach, expose Send/Interrupt/Wait,
//! emit items & debug.
//!
//! Grounded on `session::claude::ClaudeCodeRunner` (subprocess spawn, stdout
//! line loop, stderr drain task, SIGSTOP/SIGCONT pause, SIGKILL stop) and
//! `session::codex::CodexRunner` (accumulate-and-emit line loop) for the
//! subprocess shape; the JSON-RPC-over-stdio framing is hand-written from
//! the standard pending-request/oneshot idiom since no literal corpus file
//! for it was retrievable. `eventsource-stream` (confirmed as a pack crate
//! via the `redlittenyoth-cortex` manifest) backs the OpenCode SSE consumer.

pub mod claude;
pub mod codex;
pub mod custom;
pub mod opencode;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ProviderProfile;
use crate::sinks::{ItemSink, LogSink};

#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// No local OS process is supervised (e.g. remote HTTP conversations).
    pub no_process: bool,
    /// The provider emits structured items (wires an `ItemSink`).
    pub uses_items: bool,
}

#[derive(Debug, Clone)]
pub struct StartConfig {
    pub session_id: String,
    pub cwd: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub codex_home: Option<PathBuf>,
    pub provider_session_id: Option<String>,
    pub initial_input: Option<String>,
    pub profile: Option<ProviderProfile>,
}

#[derive(Debug, Clone)]
pub enum ExitOutcome {
    Exited(Option<i32>),
    Killed,
    Failed(String),
}

/// The uniform capability set every provider runtime exposes once started.
#[async_trait]
pub trait ProviderProcess: Send + Sync {
    /// Present only when a real local OS process exists.
    fn pid(&self) -> Option<u32>;
    /// The provider's stable conversation id, when known. Triggers a rekey.
    fn thread_id(&self) -> Option<String>;
    /// Resolves when the process exits, or (NoProcess) when interrupted.
    async fn wait(&self) -> ExitOutcome;
    async fn send(&self, payload: Value) -> Result<()>;
    async fn interrupt(&self) -> Result<()>;
    /// Cooperative-then-forceful stop, used by `Kill`'s ladder.
    async fn kill(&self) -> Result<()>;
    /// Lets adapters reach provider-specific operations (e.g. Codex's
    /// `thread/read`, `approval/respond`) beyond the uniform capability set.
    fn as_any(&self) -> &dyn std::any::Any;
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn capabilities(&self) -> Capabilities;
    async fn start(
        &self,
        cfg: StartConfig,
        log_sink: Arc<LogSink>,
        item_sink: Option<Arc<ItemSink>>,
    ) -> Result<Arc<dyn ProviderProcess>>;
}

/// Resolves the concrete `Provider` implementation for a normalized name.
pub fn resolve(provider: crate::model::Provider) -> Arc<dyn Provider> {
    match provider {
        crate::model::Provider::Codex => Arc::new(codex::CodexProvider),
        crate::model::Provider::Claude => Arc::new(claude::ClaudeProvider),
        crate::model::Provider::Opencode | crate::model::Provider::Kilocode => {
            Arc::new(opencode::OpenCodeProvider)
        }
        crate::model::Provider::Custom => Arc::new(custom::CustomProvider),
    }
}
