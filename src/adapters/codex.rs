//! Codex adapter: `History` reads the live thread via `thread/read`,
//! `SendMessage` starts a turn and persists `lastTurnId`, `SubscribeEvents`
//! multiplexes the item hub and closes on `turn/completed`, `Approve` calls
//! `approval/respond` and deletes the local approval record.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ApprovalDecision, ConversationAdapter};
use crate::manager::SessionManager;
use crate::model::Item;
use crate::providers::{ProviderProcess, codex::CodexProcess};
use crate::store::Stores;

pub struct CodexAdapter {
    manager: Arc<SessionManager>,
    stores: Stores,
}

impl CodexAdapter {
    pub fn new(manager: Arc<SessionManager>, stores: Stores) -> Self {
        Self { manager, stores }
    }

    /// Fetches the session's process and checks it is a Codex runtime.
    async fn process(&self, session_id: &str) -> Result<Arc<dyn ProviderProcess>> {
        let runtime = self
            .manager
            .runtime(session_id)
            .await
            .context("session not found")?;
        let process = runtime.process().context("codex session has no process")?;
        if process.as_any().downcast_ref::<CodexProcess>().is_none() {
            anyhow::bail!("process is not a codex runtime");
        }
        Ok(process)
    }
}

#[async_trait]
impl ConversationAdapter for CodexAdapter {
    async fn history(&self, session_id: &str) -> Result<Vec<Item>> {
        let process = self.process(session_id).await?;
        let codex = process.as_any().downcast_ref::<CodexProcess>().expect("checked");
        let Some(thread_id) = codex.thread_id_string().await else {
            return Ok(Vec::new());
        };
        let result = codex.call("thread/read", json!({ "threadId": thread_id })).await?;
        let turns = result
            .get("turns")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(turns.into_iter().filter_map(|v| v.as_object().cloned()).collect())
    }

    async fn send_message(&self, session_id: &str, text: &str) -> Result<Option<String>> {
        let process = self.process(session_id).await?;
        let codex = process.as_any().downcast_ref::<CodexProcess>().expect("checked");
        let thread_id = codex.thread_id_string().await;
        let response = codex
            .call("turn/start", json!({ "threadId": thread_id, "input": text }))
            .await?;
        let turn_id = response
            .get("turnId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        if let Some(turn_id) = &turn_id {
            if let Some(mut meta) = self.stores.meta().get(session_id).await? {
                meta.last_turn_id = Some(turn_id.clone());
                meta.last_active_at = chrono::Utc::now();
                self.stores.meta().upsert(&meta).await?;
            }
        }
        Ok(turn_id)
    }

    async fn subscribe_events(&self, session_id: &str) -> Result<mpsc::Receiver<Item>> {
        let runtime = self
            .manager
            .runtime(session_id)
            .await
            .context("session not found")?;
        let item_hub = runtime.item_hub.clone().context("session emits no items")?;
        let process = self.process(session_id).await?;

        let (tx, rx) = mpsc::channel(256);
        let (mut item_rx, cancel) = item_hub.add(crate::model::LogStream::Combined);
        // `turn_completed` is the only event the core spec commits to as
        // stream-closing; other notifications are forwarded as items
        // indefinitely — the caller's own cancellation ends the stream.
        tokio::spawn(async move {
            let _cancel = cancel;
            let codex = process
                .as_any()
                .downcast_ref::<CodexProcess>()
                .expect("checked by caller");
            loop {
                tokio::select! {
                    item = item_rx.recv() => {
                        match item {
                            Some(item) => {
                                if tx.send(item).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = codex.turn_completed.notified() => break,
                }
            }
        });
        Ok(rx)
    }

    async fn approve(&self, session_id: &str, request_id: u64, decision: ApprovalDecision) -> Result<()> {
        let process = self.process(session_id).await?;
        let codex = process.as_any().downcast_ref::<CodexProcess>().expect("checked");
        codex
            .call(
                "approval/respond",
                json!({
                    "requestId": request_id,
                    "decision": decision.decision,
                    "responses": decision.responses,
                    "acceptSettings": decision.accept_settings,
                }),
            )
            .await?;
        self.stores.approvals().delete(session_id, request_id).await
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        self.manager.interrupt(session_id).await
    }
}
