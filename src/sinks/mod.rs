//! Write-through sinks to append-only per-session files and broadcast (C2).
//!
//! Grounded on `session::events::EventLog`'s lazy-opened append-only JSONL
//! file idiom, extended with a second fan-out target (the hub) and an
//! idempotent close guarded by `AtomicBool`, mirroring the
//! `cancelled`/`killed` atomic-flag idiom used by the provider runners.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::hub::{DebugBuffer, DebugHub, ItemHub, LogBuffer, LogHub};
use crate::model::{DebugEvent, Item, LogEvent, LogStream};

struct AppendFile {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl AppendFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(f);
        }
        guard.as_mut().unwrap().write_all(bytes).await?;
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.file.lock().await;
        if let Some(mut f) = guard.take() {
            let _ = f.flush().await;
        }
    }
}

/// Fans each write to (a) the per-session append-only file for that stream,
/// (b) the ring buffer for that stream, and (c) the debug sink.
pub struct LogSink {
    stdout_file: AppendFile,
    stderr_file: AppendFile,
    pub stdout_buf: Arc<LogBuffer>,
    pub stderr_buf: Arc<LogBuffer>,
    log_hub: Arc<LogHub>,
    debug_sink: Arc<DebugSink>,
    closed: AtomicBool,
}

impl LogSink {
    pub fn new(
        session_dir: &Path,
        log_hub: Arc<LogHub>,
        debug_sink: Arc<DebugSink>,
        max_bytes: usize,
    ) -> Self {
        Self {
            stdout_file: AppendFile::new(session_dir.join("stdout.log")),
            stderr_file: AppendFile::new(session_dir.join("stderr.log")),
            stdout_buf: Arc::new(LogBuffer::new(max_bytes)),
            stderr_buf: Arc::new(LogBuffer::new(max_bytes)),
            log_hub,
            debug_sink,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn write(&self, stream: LogStream, chunk: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        match stream {
            LogStream::Stdout => {
                self.stdout_file.write(chunk).await?;
                self.stdout_buf.append(chunk);
            }
            LogStream::Stderr => {
                self.stderr_file.write(chunk).await?;
                self.stderr_buf.append(chunk);
            }
            LogStream::Combined => unreachable!("writes are always tagged stdout or stderr"),
        }
        let text = String::from_utf8_lossy(chunk).into_owned();
        self.log_hub
            .broadcast_filtered(stream, LogEvent::new(stream, text.clone()));
        let tag = match stream {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::Combined => "combined",
        };
        self.debug_sink.record(tag, text).await;
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.log_hub.count()
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stdout_file.close().await;
            self.stderr_file.close().await;
        }
    }
}

/// Appends a JSON line to `items.jsonl`, broadcasts via `ItemHub`, mirrors to
/// the debug sink.
pub struct ItemSink {
    file: AppendFile,
    item_hub: Arc<ItemHub>,
    debug_sink: Arc<DebugSink>,
    closed: AtomicBool,
}

impl ItemSink {
    pub fn new(session_dir: &Path, item_hub: Arc<ItemHub>, debug_sink: Arc<DebugSink>) -> Self {
        Self {
            file: AppendFile::new(session_dir.join("items.jsonl")),
            item_hub,
            debug_sink,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn write(&self, item: Item) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let line = serde_json::to_string(&item)? + "\n";
        self.file.write(line.as_bytes()).await?;
        let dump = serde_json::to_string(&item).unwrap_or_default();
        self.debug_sink.record("item", dump).await;
        self.item_hub.broadcast(item);
        Ok(())
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.file.close().await;
        }
    }
}

/// Persists line-delimited `DebugEvent`s to `debug.jsonl`, broadcasts to the
/// `DebugHub` and retains a bounded snapshot in `DebugBuffer`.
pub struct DebugSink {
    file: AppendFile,
    session_id: String,
    pub hub: Arc<DebugHub>,
    pub buffer: Arc<DebugBuffer>,
    closed: AtomicBool,
}

impl DebugSink {
    pub fn new(session_dir: &Path, session_id: String, buffer_len: usize) -> Self {
        Self {
            file: AppendFile::new(session_dir.join("debug.jsonl")),
            session_id,
            hub: Arc::new(DebugHub::new()),
            buffer: Arc::new(DebugBuffer::new(buffer_len)),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn record(&self, stream: &str, chunk: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let event = DebugEvent {
            seq: self.buffer.next_seq(),
            session_id: self.session_id.clone(),
            stream: stream.to_string(),
            chunk,
            ts: chrono::Utc::now(),
        };
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = self.file.write((line + "\n").as_bytes()).await;
        }
        self.buffer.push(event.clone());
        self.hub.broadcast(event);
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.file.close().await;
        }
    }
}
