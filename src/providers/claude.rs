//! Claude (local line-JSON subprocess). Grounded on
//! `session::claude::ClaudeCodeRunner`: each input is serialized as a CLI
//! argument and launches a fresh `claude` process; `--resume <id>` is
//! appended once the provider's own `system/init` session id is known.
//! Parse errors are reported as synthetic log items, never terminate the
//! stream. A turn's process exiting cleanly does not end the session's
//! `wait()` — only `interrupt`/`kill` or a crashing exit does, so repeated
//! `send()` calls keep driving the same long-lived session handle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};

use super::{Capabilities, ExitOutcome, Provider, ProviderProcess, StartConfig};
use crate::model::LogStream;
use crate::sinks::{ItemSink, LogSink};

pub struct ClaudeProvider;

#[async_trait]
impl Provider for ClaudeProvider {
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
        let inner = Arc::new(Inner {
            cwd: cfg.cwd.clone(),
            provider_session_id: Mutex::new(cfg.provider_session_id.clone()),
            current_child: Mutex::new(None),
            child_pid: AtomicU32::new(0),
            spawned: Notify::new(),
            stop_requested: AtomicBool::new(false),
            stopped_notify: Notify::new(),
            log_sink,
            item_sink,
        });
        if let Some(initial) = cfg.initial_input {
            spawn_turn(inner.clone(), initial).await?;
        }
        Ok(Arc::new(ClaudeProcess(inner)))
    }
}

struct Inner {
    cwd: String,
    provider_session_id: Mutex<Option<String>>,
    current_child: Mutex<Option<Child>>,
    child_pid: AtomicU32,
    spawned: Notify,
    stop_requested: AtomicBool,
    stopped_notify: Notify,
    log_sink: Arc<LogSink>,
    item_sink: Option<Arc<ItemSink>>,
}

pub struct ClaudeProcess(Arc<Inner>);

async fn spawn_turn(inner: Arc<Inner>, text: String) -> Result<()> {
    let resume = inner.provider_session_id.lock().await.clone();

    let mut cmd = Command::new("claude");
    cmd.args(["--output-format", "stream-json", "-p", &text]);
    if let Some(ref sid) = resume {
        cmd.args(["--resume", sid]);
    }

    let mut child = cmd
        .current_dir(&inner.cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .context("failed to spawn `claude` — is it installed and on PATH?")?;

    if let Some(pid) = child.id() {
        inner.child_pid.store(pid, Ordering::Relaxed);
    }
    let stdout = child.stdout.take().context("no stdout")?;
    let stderr = child.stderr.take().context("no stderr")?;

    *inner.current_child.lock().await = Some(child);
    inner.spawned.notify_waiters();

    let sink_err = inner.log_sink.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = sink_err.write(LogStream::Stderr, (line + "\n").as_bytes()).await;
        }
    });

    let this = inner.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = this.log_sink.write(LogStream::Stdout, (line.clone() + "\n").as_bytes()).await;
            match serde_json::from_str::<Value>(&line) {
                Ok(Value::Object(map)) => {
                    if map.get("type").and_then(Value::as_str) == Some("system") {
                        if let Some(sid) = map.get("session_id").and_then(Value::as_str) {
                            *this.provider_session_id.lock().await = Some(sid.to_string());
                        }
                    }
                    if let Some(item_sink) = &this.item_sink {
                        let _ = item_sink.write(map).await;
                    }
                }
                Ok(_) | Err(_) => {
                    if let Some(item_sink) = &this.item_sink {
                        let mut synthetic = serde_json::Map::new();
                        synthetic.insert("type".into(), Value::String("log".into()));
                        synthetic.insert("text".into(), Value::String(line));
                        let _ = item_sink.write(synthetic).await;
                    }
                }
            }
        }
    });

    Ok(())
}

#[async_trait]
impl ProviderProcess for ClaudeProcess {
    fn pid(&self) -> Option<u32> {
        let p = self.0.child_pid.load(Ordering::Relaxed);
        (p != 0).then_some(p)
    }

    fn thread_id(&self) -> Option<String> {
        None
    }

    async fn wait(&self) -> ExitOutcome {
        let inner = &self.0;
        loop {
            if inner.stop_requested.load(Ordering::SeqCst) {
                return ExitOutcome::Killed;
            }
            let has_child = inner.current_child.lock().await.is_some();
            if !has_child {
                tokio::select! {
                    _ = inner.spawned.notified() => continue,
                    _ = inner.stopped_notify.notified() => return ExitOutcome::Killed,
                }
            }
            let status = {
                let wait_fut = async {
                    let mut guard = inner.current_child.lock().await;
                    match guard.as_mut() {
                        Some(child) => child.wait().await.ok(),
                        None => None,
                    }
                };
                tokio::select! {
                    s = wait_fut => s,
                    _ = inner.stopped_notify.notified() => return ExitOutcome::Killed,
                }
            };
            *inner.current_child.lock().await = None;
            inner.child_pid.store(0, Ordering::Relaxed);
            match status {
                Some(s) if !s.success() => {
                    return ExitOutcome::Failed(format!("exit code {:?}", s.code()))
                }
                _ => continue,
            }
        }
    }

    async fn send(&self, payload: Value) -> Result<()> {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .context("claude send payload missing text")?
            .to_string();
        spawn_turn(self.0.clone(), text).await
    }

    async fn interrupt(&self) -> Result<()> {
        if let Some(child) = self.0.current_child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.0.stop_requested.store(true, Ordering::SeqCst);
        if let Some(child) = self.0.current_child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
        self.0.stopped_notify.notify_waiters();
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
