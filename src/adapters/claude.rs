//! Claude adapter: `SendMessage` sends directly when the runtime is
//! resident; when it's gone (e.g. after a daemon restart) and a
//! `providerSessionId` is on record, it re-attaches via `--resume` and
//! retries once. `Approve` and `SubscribeEvents` are unsupported per spec
//! §4.5.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ApprovalDecision, ConversationAdapter};
use crate::manager::{SessionManager, StartRequest};
use crate::model::Item;
use crate::store::Stores;

pub struct ClaudeAdapter {
    manager: Arc<SessionManager>,
    stores: Stores,
}

impl ClaudeAdapter {
    pub fn new(manager: Arc<SessionManager>, stores: Stores) -> Self {
        Self { manager, stores }
    }

    /// Re-attaches a non-resident session to its provider conversation and
    /// retries the send once.
    async fn resume_and_retry(&self, session_id: &str, text: &str) -> Result<()> {
        let record = self
            .stores
            .sessions()
            .get(session_id)
            .await?
            .context("session not found")?;
        let meta = self
            .stores
            .meta()
            .get(session_id)
            .await?
            .context("session meta not found")?;
        let provider_session_id = meta
            .provider_session_id
            .context("no providerSessionId on record — cannot resume")?;

        self.manager
            .start(StartRequest {
                reuse_id: Some(session_id.to_string()),
                provider: record.session.provider,
                cwd: record.session.cwd,
                cmd: record.session.cmd,
                args: record.session.args,
                env: record.session.env,
                title: record.session.title,
                codex_home: None,
                initial_input: Some(text.to_string()),
                profile: None,
                resume_provider_session_id: Some(provider_session_id),
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationAdapter for ClaudeAdapter {
    async fn history(&self, session_id: &str) -> Result<Vec<Item>> {
        super::default::DefaultAdapter::new(self.manager.clone())
            .history(session_id)
            .await
    }

    async fn send_message(&self, session_id: &str, text: &str) -> Result<Option<String>> {
        let payload = json!({ "text": text });
        match self.manager.send(session_id, payload.clone()).await {
            Ok(()) => Ok(None),
            Err(_) if self.manager.runtime(session_id).await.is_none() => {
                self.resume_and_retry(session_id, text).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn subscribe_events(&self, _session_id: &str) -> Result<mpsc::Receiver<Item>> {
        Err(anyhow!("Claude does not support structured event subscription"))
    }

    async fn approve(&self, _session_id: &str, _request_id: u64, _decision: ApprovalDecision) -> Result<()> {
        Err(anyhow!("Claude does not support approvals"))
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        self.manager.interrupt(session_id).await
    }
}
