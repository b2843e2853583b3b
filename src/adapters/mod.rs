//! ConversationAdapter registry (C5): per-provider `{History, SendMessage,
//! SubscribeEvents, Approve, Interrupt}` over the uniform provider API.
//!
//! Grounded on the per-provider runner split itself (`claude.rs`/`codex.rs`/
//! `opencode.rs` each owning their own protocol quirks) generalized one
//! layer up so the manager stays protocol-agnostic and the adapter owns
//! protocol mapping, per spec §4.5.

pub mod claude;
pub mod codex;
pub mod default;
pub mod opencode;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::manager::SessionManager;
use crate::model::{Item, Provider};
use crate::store::Stores;

/// A single approval decision, forwarded to `Approve`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApprovalDecision {
    pub decision: String,
    #[serde(default)]
    pub responses: Option<serde_json::Value>,
    #[serde(default)]
    pub accept_settings: Option<serde_json::Value>,
}

#[async_trait]
pub trait ConversationAdapter: Send + Sync {
    /// Flattens the provider's conversation history into items.
    async fn history(&self, session_id: &str) -> Result<Vec<Item>>;
    /// Sends a user turn, returning a provider turn id when known.
    async fn send_message(&self, session_id: &str, text: &str) -> Result<Option<String>>;
    /// Opens a live item stream; the channel closes when the provider
    /// signals turn completion or the session ends.
    async fn subscribe_events(&self, session_id: &str) -> Result<mpsc::Receiver<Item>>;
    async fn approve(&self, session_id: &str, request_id: u64, decision: ApprovalDecision) -> Result<()>;
    async fn interrupt(&self, session_id: &str) -> Result<()>;
}

/// Resolves the `ConversationAdapter` for a provider, backed by the shared
/// manager/stores the adapters delegate to.
pub fn resolve(
    provider: Provider,
    manager: Arc<SessionManager>,
    stores: Stores,
) -> Arc<dyn ConversationAdapter> {
    match provider {
        Provider::Codex => Arc::new(codex::CodexAdapter::new(manager, stores)),
        Provider::Claude => Arc::new(claude::ClaudeAdapter::new(manager, stores)),
        Provider::Opencode | Provider::Kilocode => {
            Arc::new(opencode::OpenCodeAdapter::new(manager, stores))
        }
        Provider::Custom => Arc::new(default::DefaultAdapter::new(manager)),
    }
}
