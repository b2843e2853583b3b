//! OpenCode/KiloCode adapter: mirrors Claude's send-or-resume-and-retry flow
//! against the HTTP provider; `SubscribeEvents` re-emits the provider's SSE
//! stream as items; `Approve` calls `ReplyPermission` using the upstream
//! permission id stored in the approval's params.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ApprovalDecision, ConversationAdapter};
use crate::manager::{SessionManager, StartRequest};
use crate::model::Item;
use crate::providers::opencode::OpenCodeProcess;
use crate::store::Stores;

pub struct OpenCodeAdapter {
    manager: Arc<SessionManager>,
    stores: Stores,
}

impl OpenCodeAdapter {
    pub fn new(manager: Arc<SessionManager>, stores: Stores) -> Self {
        Self { manager, stores }
    }

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
impl ConversationAdapter for OpenCodeAdapter {
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

    async fn subscribe_events(&self, session_id: &str) -> Result<mpsc::Receiver<Item>> {
        let runtime = self
            .manager
            .runtime(session_id)
            .await
            .context("session not found")?;
        let item_hub = runtime.item_hub.clone().context("session emits no items")?;
        let (mut item_rx, cancel) = item_hub.add(crate::model::LogStream::Combined);
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let _cancel = cancel;
            while let Some(item) = item_rx.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// Requires the upstream permission id carried in the approval's params.
    async fn approve(&self, session_id: &str, request_id: u64, decision: ApprovalDecision) -> Result<()> {
        let approvals = self.stores.approvals().list_for_session(session_id).await?;
        let approval = approvals
            .into_iter()
            .find(|a| a.request_id == request_id)
            .context("approval not found")?;
        let permission_id = extract_permission_id(&approval)?;

        let runtime = self
            .manager
            .runtime(session_id)
            .await
            .context("session not found")?;
        let process = runtime.process().context("session has no process")?;
        let opencode = process
            .as_any()
            .downcast_ref::<OpenCodeProcess>()
            .context("process is not an opencode runtime")?;
        opencode.reply_permission(&permission_id, &decision.decision).await?;
        self.stores.approvals().delete(session_id, request_id).await
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        match self.manager.interrupt(session_id).await {
            Ok(()) => Ok(()),
            Err(_) if self.manager.runtime(session_id).await.is_none() => {
                self.resume_and_retry(session_id, "").await
            }
            Err(e) => Err(anyhow!(e)),
        }
    }
}

/// The approval's `params` is the raw OpenCode permission object (see
/// `syncer::classify_opencode_item`), which keys the permission id as `id`.
fn extract_permission_id(approval: &crate::model::Approval) -> Result<String> {
    approval
        .params
        .get("id")
        .and_then(|v| v.as_str())
        .context("approval has no upstream permission id")
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn approval_with_params(params: serde_json::Value) -> crate::model::Approval {
        crate::model::Approval {
            session_id: "s1".to_string(),
            request_id: 42,
            method: "permission".to_string(),
            params,
            created_at: Utc::now(),
        }
    }

    /// Scenario F: an OpenCode permission round trip — the id stored by the
    /// syncer under `id` must be the same key `approve` reads back out.
    #[test]
    fn approve_reads_permission_id_from_id_field() {
        let approval = approval_with_params(json!({ "id": "P-42", "status": "pending" }));
        assert_eq!(extract_permission_id(&approval).unwrap(), "P-42");
    }

    #[test]
    fn approve_rejects_legacy_permission_id_key() {
        let approval = approval_with_params(json!({ "permissionId": "P-42" }));
        assert!(extract_permission_id(&approval).is_err());
    }
}
