//! Default adapter: "not supported" for everything except `History`, which
//! reads `items.jsonl` when present and otherwise tails the combined
//! stdout/stderr logs, converting raw lines into `{type:"log", text}` items.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use super::{ApprovalDecision, ConversationAdapter};
use crate::manager::SessionManager;
use crate::model::Item;

pub struct DefaultAdapter {
    manager: Arc<SessionManager>,
}

impl DefaultAdapter {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ConversationAdapter for DefaultAdapter {
    async fn history(&self, session_id: &str) -> Result<Vec<Item>> {
        let dir = self.manager.session_dir(session_id);
        let items_path = dir.join("items.jsonl");
        if let Ok(contents) = tokio::fs::read_to_string(&items_path).await {
            return Ok(contents
                .lines()
                .filter_map(|line| serde_json::from_str::<Item>(line).ok())
                .collect());
        }

        let mut items = Vec::new();
        for name in ["stdout.log", "stderr.log"] {
            let path = dir.join(name);
            let Ok(file) = tokio::fs::File::open(&path).await else {
                continue;
            };
            let mut lines = tokio::io::BufReader::new(file).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut item = serde_json::Map::new();
                item.insert("type".into(), serde_json::Value::String("log".into()));
                item.insert("text".into(), serde_json::Value::String(line));
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn send_message(&self, _session_id: &str, _text: &str) -> Result<Option<String>> {
        Err(anyhow!("conversation operations are not supported for this provider"))
    }

    async fn subscribe_events(&self, _session_id: &str) -> Result<mpsc::Receiver<Item>> {
        Err(anyhow!("conversation operations are not supported for this provider"))
    }

    async fn approve(
        &self,
        _session_id: &str,
        _request_id: u64,
        _decision: ApprovalDecision,
    ) -> Result<()> {
        Err(anyhow!("approvals are not supported for this provider"))
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        self.manager.interrupt(session_id).await
    }
}
