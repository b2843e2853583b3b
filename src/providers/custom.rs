//! Custom provider — an arbitrary subprocess with no conversation semantics;
//! only logs flow. Grounded on `ClaudeCodeRunner`'s spawn/stdout-stderr/kill
//! shape, stripped of provider-specific parsing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{Capabilities, ExitOutcome, Provider, ProviderProcess, StartConfig};
use crate::model::LogStream;
use crate::sinks::{ItemSink, LogSink};

pub struct CustomProvider;

#[async_trait]
impl Provider for CustomProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            no_process: false,
            uses_items: false,
        }
    }

    async fn start(
        &self,
        cfg: StartConfig,
        log_sink: Arc<LogSink>,
        _item_sink: Option<Arc<ItemSink>>,
    ) -> Result<Arc<dyn ProviderProcess>> {
        let mut command = Command::new(&cfg.cmd);
        command
            .args(&cfg.args)
            .current_dir(&cfg.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (k, v) in &cfg.env {
            command.env(k, v);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", cfg.cmd))?;
        let pid = child.id().unwrap_or(0);
        let stdout = child.stdout.take().context("no stdout")?;
        let stderr = child.stderr.take().context("no stderr")?;

        let sink_out = log_sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = sink_out.write(LogStream::Stdout, (line + "\n").as_bytes()).await;
            }
        });
        let sink_err = log_sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = sink_err.write(LogStream::Stderr, (line + "\n").as_bytes()).await;
            }
        });

        Ok(Arc::new(CustomProcess {
            pid: AtomicU32::new(pid),
            child: Mutex::new(Some(child)),
            killed: AtomicBool::new(false),
        }))
    }
}

pub struct CustomProcess {
    pid: AtomicU32,
    child: Mutex<Option<Child>>,
    killed: AtomicBool,
}

#[async_trait]
impl ProviderProcess for CustomProcess {
    fn pid(&self) -> Option<u32> {
        let p = self.pid.load(Ordering::Relaxed);
        (p != 0).then_some(p)
    }

    fn thread_id(&self) -> Option<String> {
        None
    }

    async fn wait(&self) -> ExitOutcome {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match child.wait().await {
                Ok(status) => {
                    *guard = None;
                    if self.killed.load(Ordering::SeqCst) {
                        ExitOutcome::Killed
                    } else {
                        ExitOutcome::Exited(status.code())
                    }
                }
                Err(e) => ExitOutcome::Failed(e.to_string()),
            }
        } else {
            ExitOutcome::Exited(None)
        }
    }

    async fn send(&self, _payload: Value) -> Result<()> {
        anyhow::bail!("custom provider does not accept conversation input")
    }

    async fn interrupt(&self) -> Result<()> {
        self.kill().await
    }

    async fn kill(&self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
