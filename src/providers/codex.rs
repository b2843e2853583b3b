//! Codex (local JSON-RPC subprocess). Launched via `<cmd> app-server`.
//! Grounded on `session::codex::CodexRunner`'s accumulate-and-emit line loop
//! for the subprocess shape; the JSON-RPC-over-stdio framing (pending
//! requests keyed by id, resolved via oneshot) is the standard idiom for
//! this pattern since no literal corpus file was retrievable for it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, Notify};

use super::{Capabilities, ExitOutcome, Provider, ProviderProcess, StartConfig};
use crate::model::LogStream;
use crate::sinks::{ItemSink, LogSink};

pub struct CodexProvider;

#[async_trait]
impl Provider for CodexProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            no_process: false,
            uses_items: true,
        }
    }

    async fn start(
        &self,
        cfg: StartConfig,
        log_sink: Arc<LogSink>,
        item_sink: Option<Arc<ItemSink>>,
    ) -> Result<Arc<dyn ProviderProcess>> {
        let mut command = Command::new(&cfg.cmd);
        command
            .arg("app-server")
            .current_dir(&cfg.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(home) = &cfg.codex_home {
            command.env("CODEX_HOME", home);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{} app-server`", cfg.cmd))?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().context("no stdin")?;
        let stdout = child.stdout.take().context("no stdout")?;
        let stderr = child.stderr.take().context("no stderr")?;

        let process = Arc::new(CodexProcess {
            pid: AtomicU32::new(pid),
            stdin: Mutex::new(stdin),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            thread_id: Mutex::new(None),
            child: Mutex::new(Some(child)),
            log_sink: log_sink.clone(),
            item_sink: item_sink.clone(),
            turn_completed: Notify::new(),
        });

        let sink_err = log_sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = sink_err.write(LogStream::Stderr, (line + "\n").as_bytes()).await;
            }
        });

        let reader_proc = process.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = reader_proc
                    .log_sink
                    .write(LogStream::Stdout, (line.clone() + "\n").as_bytes())
                    .await;
                reader_proc.handle_line(&line).await;
            }
        });

        let thread = process.call("thread/start", json!({})).await?;
        if let Some(tid) = thread.get("threadId").and_then(Value::as_str) {
            *process.thread_id.lock().await = Some(tid.to_string());
        }

        if let Some(initial) = cfg.initial_input {
            process.start_turn(&initial).await?;
        }

        Ok(process)
    }
}

pub struct CodexProcess {
    pid: AtomicU32,
    stdin: Mutex<ChildStdin>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    thread_id: Mutex<Option<String>>,
    child: Mutex<Option<Child>>,
    log_sink: Arc<LogSink>,
    item_sink: Option<Arc<ItemSink>>,
    /// Notified when a `turn/completed` notification arrives; lets adapters'
    /// `SubscribeEvents` close their stream cleanly (the only method the
    /// core spec commits to as stream-closing).
    pub turn_completed: Notify,
}

impl CodexProcess {
    async fn handle_line(&self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                if let Some(item_sink) = &self.item_sink {
                    let mut synthetic = serde_json::Map::new();
                    synthetic.insert("type".into(), Value::String("log".into()));
                    synthetic.insert("text".into(), Value::String(line.to_string()));
                    let _ = item_sink.write(synthetic).await;
                }
                return;
            }
        };

        // A response carries "id" and either "result" or "error".
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if value.get("result").is_some() || value.get("error").is_some() {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(value.get("result").cloned().unwrap_or(Value::Null));
                    return;
                }
            }
        }

        // Otherwise it's a notification: {method, params}.
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            if method == "turn/completed" {
                self.turn_completed.notify_waiters();
            }
            if let Some(item_sink) = &self.item_sink {
                let mut item = serde_json::Map::new();
                item.insert("type".into(), Value::String(method.to_string()));
                item.insert(
                    "params".into(),
                    value.get("params").cloned().unwrap_or(Value::Null),
                );
                let _ = item_sink.write(item).await;
            }
        }
    }

    /// Issues a JSON-RPC call and awaits its response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.stdin.lock().await.write_all(line.as_bytes()).await?;

        rx.await.context("codex app-server closed before responding")
    }

    /// Fire-and-forget JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let request = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.stdin.lock().await.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn thread_id_string(&self) -> Option<String> {
        self.thread_id.lock().await.clone()
    }

    async fn start_turn(&self, text: &str) -> Result<String> {
        let thread_id = self.thread_id.lock().await.clone();
        let result = self
            .call(
                "turn/start",
                json!({ "threadId": thread_id, "input": text }),
            )
            .await?;
        Ok(result
            .get("turnId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl ProviderProcess for CodexProcess {
    fn pid(&self) -> Option<u32> {
        let p = self.pid.load(Ordering::Relaxed);
        (p != 0).then_some(p)
    }

    fn thread_id(&self) -> Option<String> {
        // Best-effort synchronous peek; callers needing the authoritative
        // value use `thread_id_string()`. `try_lock` avoids blocking the
        // manager's start-path critical section.
        self.thread_id.try_lock().ok().and_then(|g| g.clone())
    }

    async fn wait(&self) -> ExitOutcome {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match child.wait().await {
                Ok(status) => {
                    *guard = None;
                    ExitOutcome::Exited(status.code())
                }
                Err(e) => ExitOutcome::Failed(e.to_string()),
            }
        } else {
            ExitOutcome::Exited(None)
        }
    }

    async fn send(&self, payload: Value) -> Result<()> {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .context("codex send payload missing text")?;
        self.start_turn(text).await?;
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        let thread_id = self.thread_id.lock().await.clone();
        self.notify("turn/cancel", json!({ "threadId": thread_id })).await
    }

    async fn kill(&self) -> Result<()> {
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
