//! OpenCode/KiloCode (remote HTTP server with SSE events). Grounded on
//! `rest/sse.rs`'s `stream::unfold` consumption pattern for the local-facing
//! SSE side, and `eventsource-stream` (confirmed as a pack crate via the
//! `redlittenyoth-cortex` manifest) for consuming the *upstream* SSE stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{Capabilities, ExitOutcome, Provider, ProviderProcess, StartConfig};
use crate::sinks::ItemSink;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4096";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct OpenCodeProvider;

#[async_trait]
impl Provider for OpenCodeProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            no_process: true,
            uses_items: true,
        }
    }

    async fn start(
        &self,
        cfg: StartConfig,
        _log_sink: Arc<crate::sinks::LogSink>,
        item_sink: Option<Arc<ItemSink>>,
    ) -> Result<Arc<dyn ProviderProcess>> {
        let profile = cfg.profile.clone().unwrap_or_default();
        let base_url = profile
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let timeout = Duration::from_secs(profile.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));

        let mut builder = reqwest::Client::builder().timeout(timeout);
        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Some(env_name) = &profile.bearer_env {
            if let Ok(token) = std::env::var(env_name) {
                let value = format!("Bearer {token}");
                default_headers.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&value)?,
                );
            }
        }
        builder = builder.default_headers(default_headers);
        let client = builder.build().context("failed to build OpenCode HTTP client")?;

        let session_id = if let Some(existing) = cfg.provider_session_id.clone() {
            existing
        } else {
            let resp: Value = client
                .post(format!("{base_url}/session"))
                .query(&[("directory", cfg.cwd.as_str())])
                .send()
                .await
                .context("POST /session failed")?
                .json()
                .await
                .context("invalid /session response")?;
            resp.get("id")
                .and_then(Value::as_str)
                .context("missing session id in /session response")?
                .to_string()
        };

        let process = Arc::new(OpenCodeProcess {
            client,
            base_url,
            provider_session_id: Mutex::new(Some(session_id.clone())),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            item_sink,
        });

        process.clone().spawn_event_loop(session_id.clone());

        if let Some(initial) = cfg.initial_input {
            process.prompt(&session_id, &initial).await?;
        }

        Ok(process)
    }
}

pub struct OpenCodeProcess {
    client: reqwest::Client,
    base_url: String,
    provider_session_id: Mutex<Option<String>>,
    stopped: AtomicBool,
    stop_notify: Notify,
    item_sink: Option<Arc<ItemSink>>,
}

impl OpenCodeProcess {
    pub async fn provider_session_id(&self) -> Option<String> {
        self.provider_session_id.lock().await.clone()
    }

    fn spawn_event_loop(self: Arc<Self>, session_id: String) {
        tokio::spawn(async move {
            let url = format!("{}/session/{}/event", self.base_url, session_id);
            // Open Question (spec §9): retry at global scope on any stream
            // error rather than gating on specific status codes.
            loop {
                if self.stopped.load(Ordering::SeqCst) {
                    return;
                }
                let resp = match self.client.get(&url).send().await {
                    Ok(r) => r,
                    Err(_) => {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let mut stream = resp.bytes_stream().eventsource();
                while let Some(event) = stream.next().await {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    let Ok(event) = event else { break };
                    if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                        if let (Some(item_sink), Value::Object(map)) = (&self.item_sink, value) {
                            let _ = item_sink.write(map).await;
                        }
                    }
                }
                // Stream closed — fall back to global scope / retry.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    async fn prompt(&self, session_id: &str, text: &str) -> Result<()> {
        self.client
            .post(format!("{}/session/{}/prompt", self.base_url, session_id))
            .json(&json!({ "content": text }))
            .send()
            .await
            .context("POST /session/{id}/prompt failed")?;
        Ok(())
    }

    /// Lists currently outstanding permission requests for the resync path
    /// (spec §4.7): authoritative — the caller reconciles local approvals
    /// against whatever ids come back.
    pub async fn list_permissions(&self) -> Result<Vec<Value>> {
        let session_id = self
            .provider_session_id()
            .await
            .context("no provider session id")?;
        let resp: Value = self
            .client
            .get(format!("{}/session/{}/permission", self.base_url, session_id))
            .send()
            .await
            .context("GET /session/{id}/permission failed")?
            .json()
            .await
            .context("invalid permission list response")?;
        Ok(resp.as_array().cloned().unwrap_or_default())
    }

    /// Replies to a permission ("approval") request surfaced over SSE.
    pub async fn reply_permission(&self, permission_id: &str, decision: &str) -> Result<()> {
        let session_id = self
            .provider_session_id()
            .await
            .context("no provider session id")?;
        self.client
            .post(format!(
                "{}/session/{}/permission",
                self.base_url, session_id
            ))
            .json(&json!({ "permissionId": permission_id, "decision": decision }))
            .send()
            .await
            .context("POST /session/{id}/permission failed")?;
        Ok(())
    }
}

#[async_trait]
impl ProviderProcess for OpenCodeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn thread_id(&self) -> Option<String> {
        None
    }

    async fn wait(&self) -> ExitOutcome {
        self.stop_notify.notified().await;
        ExitOutcome::Killed
    }

    async fn send(&self, payload: Value) -> Result<()> {
        let session_id = self
            .provider_session_id()
            .await
            .context("no provider session id")?;
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .context("opencode send payload missing text")?;
        self.prompt(&session_id, text).await
    }

    async fn interrupt(&self) -> Result<()> {
        let session_id = self
            .provider_session_id()
            .await
            .context("no provider session id")?;
        self.client
            .post(format!("{}/session/{}/abort", self.base_url, session_id))
            .send()
            .await
            .context("POST /session/{id}/abort failed")?;
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.interrupt().await;
        self.stop_notify.notify_waiters();
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
