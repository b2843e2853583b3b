//! SessionManager (C4): owns the mutex-guarded `id -> runtime` map and the
//! per-session supervisor/flush goroutines.
//!
//! Grounded on `session::SessionManager` (`RwLock<HashMap<String, Arc<..>>>`
//! of handles, a `drain()` that stops every live runner with a bounded
//! timeout during shutdown) generalized from a single-process-per-turn CLI
//! model to a long-lived per-session runtime plus a rekey operation.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

use crate::config::{DaemonConfig, ProviderProfile};
use crate::error::CoreError;
use crate::hub::{DebugHub, ItemHub, LogHub};
use crate::model::{Provider, RecordSource, Session, SessionMeta, SessionRecord, Status};
use crate::providers::{self, ExitOutcome, ProviderProcess, StartConfig};
use crate::sinks::{DebugSink, ItemSink, LogSink};
use crate::store::Stores;

const FLUSH_CHUNK_BYTES: usize = 16 * 1024;
const FLUSH_CHUNKS_PER_TICK: usize = 8;
const KILL_COOPERATIVE_WAIT: Duration = Duration::from_secs(1);
const KILL_SIGTERM_WAIT: Duration = Duration::from_secs(3);

/// In-memory state for a live session; mirrors the on-disk record and meta
/// while the session is supervised.
pub struct Runtime {
    pub session: RwLock<Session>,
    process: tokio::sync::OnceCell<Arc<dyn ProviderProcess>>,
    no_process: bool,
    uses_items: bool,
    pub log_hub: Arc<LogHub>,
    pub item_hub: Option<Arc<ItemHub>>,
    pub debug_hub: Arc<DebugHub>,
    pub log_sink: Arc<LogSink>,
    pub item_sink: Option<Arc<ItemSink>>,
    pub debug_sink: Arc<DebugSink>,
    killed: std::sync::atomic::AtomicBool,
    done: Notify,
    done_flag: std::sync::atomic::AtomicBool,
}

impl Runtime {
    /// The provider's process handle, once `start` has attached it. Lets
    /// adapters downcast via `ProviderProcess::as_any` to reach
    /// provider-specific operations beyond the uniform capability set.
    pub fn process(&self) -> Option<Arc<dyn ProviderProcess>> {
        self.process.get().cloned()
    }

    fn is_done(&self) -> bool {
        self.done_flag.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn wait_done(&self) {
        if self.is_done() {
            return;
        }
        self.done.notified().await;
    }

    fn mark_done(&self) {
        self.done_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        self.done.notify_waiters();
    }
}

/// Parameters for `SessionManager::start`. `resume_provider_session_id` lets
/// the Claude/OpenCode adapters re-attach a runtime to an existing provider
/// conversation after the in-memory handle is gone (e.g. post-restart).
pub struct StartRequest {
    /// Reuses an existing session id (used when re-attaching a resident-lost
    /// session to its provider conversation) instead of allocating a fresh
    /// one.
    pub reuse_id: Option<String>,
    pub provider: Provider,
    pub cwd: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub title: String,
    pub codex_home: Option<PathBuf>,
    pub initial_input: Option<String>,
    pub profile: Option<ProviderProfile>,
    pub resume_provider_session_id: Option<String>,
}

pub struct SessionManager {
    base_dir: PathBuf,
    stores: Stores,
    config: DaemonConfig,
    runtimes: RwLock<HashMap<String, Arc<Runtime>>>,
}

impl SessionManager {
    pub fn new(base_dir: PathBuf, stores: Stores, config: DaemonConfig) -> Self {
        Self {
            base_dir,
            stores,
            config,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    pub async fn runtime(&self, id: &str) -> Option<Arc<Runtime>> {
        self.runtimes.read().await.get(id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.runtimes.read().await.len()
    }

    /// StartSession (spec §4.4): resolves the provider, allocates storage,
    /// invokes `Provider::start` outside the map lock, rekeys if the
    /// provider reports a stable thread id, and spawns the supervisor.
    pub async fn start(&self, req: StartRequest) -> Result<SessionRecord> {
        let StartRequest {
            reuse_id,
            provider,
            cwd,
            cmd,
            args,
            env,
            title,
            codex_home,
            initial_input,
            profile,
            resume_provider_session_id,
        } = req;

        let runner = providers::resolve(provider);
        let caps = runner.capabilities();

        let id = reuse_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let dir = self.session_dir(&id);
        tokio::fs::create_dir_all(&dir).await?;

        let log_hub = Arc::new(LogHub::new());
        let item_hub = caps.uses_items.then(|| Arc::new(ItemHub::new()));
        let debug_sink = Arc::new(DebugSink::new(&dir, id.clone(), self.config.debug_buffer_len));
        let log_sink = Arc::new(LogSink::new(
            &dir,
            log_hub.clone(),
            debug_sink.clone(),
            self.config.log_buffer_bytes,
        ));
        let item_sink = item_hub
            .clone()
            .map(|hub| Arc::new(ItemSink::new(&dir, hub, debug_sink.clone())));

        let now = chrono::Utc::now();
        let session = Session {
            id: id.clone(),
            provider,
            cwd: cwd.clone(),
            cmd: cmd.clone(),
            args: args.clone(),
            env: env.clone(),
            status: Status::Starting,
            created_at: now,
            started_at: None,
            exited_at: None,
            pid: None,
            exit_code: None,
            title,
            tags: Vec::new(),
        };

        let runtime = Arc::new(Runtime {
            session: RwLock::new(session.clone()),
            process: tokio::sync::OnceCell::new(),
            no_process: caps.no_process,
            uses_items: caps.uses_items,
            log_hub,
            item_hub,
            debug_hub: debug_sink.hub.clone(),
            log_sink: log_sink.clone(),
            item_sink: item_sink.clone(),
            debug_sink,
            killed: std::sync::atomic::AtomicBool::new(false),
            done: Notify::new(),
            done_flag: std::sync::atomic::AtomicBool::new(false),
        });
        self.runtimes.write().await.insert(id.clone(), runtime.clone());

        let cfg = StartConfig {
            session_id: id.clone(),
            cwd,
            cmd,
            args,
            env,
            codex_home,
            provider_session_id: resume_provider_session_id,
            initial_input,
            profile,
        };

        let start_result = runner.start(cfg, log_sink, item_sink).await;

        let process = match start_result {
            Ok(p) => p,
            Err(e) => {
                let mut guard = runtime.session.write().await;
                guard.status = Status::Failed;
                guard.exited_at = Some(chrono::Utc::now());
                let record = SessionRecord {
                    session: guard.clone(),
                    source: RecordSource::Internal,
                };
                drop(guard);
                self.stores.sessions().upsert(&record).await?;
                return Err(e);
            }
        };

        let thread_id = process.thread_id();
        let pid = process.pid();

        let mut final_id = id.clone();
        {
            let mut guard = runtime.session.write().await;
            guard.pid = pid;
            guard.started_at = Some(chrono::Utc::now());
            guard.status = if caps.no_process {
                Status::Inactive
            } else {
                Status::Running
            };
        }

        let _ = runtime.process.set(process.clone());

        if let Some(ref tid) = thread_id {
            if tid != &id {
                final_id = self.rekey(&id, tid, runtime.clone()).await?;
            }
        }

        let mut meta = self
            .stores
            .meta()
            .get(&final_id)
            .await?
            .unwrap_or_else(|| SessionMeta::new(final_id.clone()));
        meta.thread_id = thread_id.clone();
        self.stores.meta().upsert(&meta).await?;

        let record = {
            let guard = runtime.session.read().await;
            SessionRecord {
                session: guard.clone(),
                source: RecordSource::Internal,
            }
        };
        self.stores.sessions().upsert(&record).await?;

        self.spawn_supervisor(final_id.clone(), runtime.clone(), process.clone());
        self.spawn_flush_loop(final_id.clone(), runtime.clone());
        if runtime.item_hub.is_some() {
            self.spawn_approval_listener(final_id.clone(), runtime.clone(), provider);
        }

        Ok(record)
    }

    /// Supervisor goroutine: blocks on `ProviderProcess::wait`, classifies
    /// the outcome, persists the terminal state, and closes sinks.
    fn spawn_supervisor(&self, id: String, runtime: Arc<Runtime>, process: Arc<dyn ProviderProcess>) {
        let stores = self.stores.clone();
        tokio::spawn(async move {
            let outcome = process.wait().await;
            let killed = runtime.killed.load(std::sync::atomic::Ordering::SeqCst);

            let status = if killed {
                Status::Killed
            } else {
                match &outcome {
                    ExitOutcome::Killed => Status::Killed,
                    ExitOutcome::Exited(Some(0)) | ExitOutcome::Exited(None) => Status::Exited,
                    ExitOutcome::Exited(Some(_)) => Status::Failed,
                    ExitOutcome::Failed(_) => Status::Failed,
                }
            };
            let exit_code = match &outcome {
                ExitOutcome::Exited(code) => *code,
                _ => None,
            };

            {
                let mut guard = runtime.session.write().await;
                guard.status = status;
                guard.exit_code = exit_code;
                guard.exited_at = Some(chrono::Utc::now());
            }

            let record = {
                let guard = runtime.session.read().await;
                SessionRecord {
                    session: guard.clone(),
                    source: RecordSource::Internal,
                }
            };
            if let Err(e) = stores.sessions().upsert(&record).await {
                warn!(id = %id, err = %e, "failed to persist terminal session state");
            }

            info!(id = %id, status = status.as_str(), "session supervisor exiting");

            runtime.log_sink.close().await;
            if let Some(sink) = &runtime.item_sink {
                sink.close().await;
            }
            runtime.debug_sink.close().await;
            runtime.mark_done();
        });
    }

    /// Flush loop: ticks every `flush_interval_ms`, draining bounded chunks
    /// from the stdout/stderr ring buffers so a tight producer never starves
    /// the runtime; clears buffers entirely when nobody is subscribed.
    fn spawn_flush_loop(&self, id: String, runtime: Arc<Runtime>) {
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = runtime.wait_done() => break,
                }
                if runtime.is_done() {
                    break;
                }
                if runtime.log_sink.subscriber_count() == 0 {
                    runtime.log_sink.stdout_buf.clear();
                    runtime.log_sink.stderr_buf.clear();
                    continue;
                }
                for _ in 0..FLUSH_CHUNKS_PER_TICK {
                    let out = runtime.log_sink.stdout_buf.drain(FLUSH_CHUNK_BYTES);
                    if !out.is_empty() {
                        let text = String::from_utf8_lossy(&out).into_owned();
                        runtime.log_hub.broadcast_filtered(
                            crate::model::LogStream::Stdout,
                            crate::model::LogEvent::new(crate::model::LogStream::Stdout, text),
                        );
                    }
                    let err = runtime.log_sink.stderr_buf.drain(FLUSH_CHUNK_BYTES);
                    if !err.is_empty() {
                        let text = String::from_utf8_lossy(&err).into_owned();
                        runtime.log_hub.broadcast_filtered(
                            crate::model::LogStream::Stderr,
                            crate::model::LogEvent::new(crate::model::LogStream::Stderr, text),
                        );
                    }
                    if out.is_empty() && err.is_empty() {
                        break;
                    }
                }
            }
            tracing::debug!(id = %id, "flush loop exiting");
        });
    }

    /// Approval listener: subscribes the session's item stream and upserts
    /// or deletes `Approval` rows as the provider raises and resolves
    /// requests, keeping the store live without waiting on a resync.
    fn spawn_approval_listener(&self, id: String, runtime: Arc<Runtime>, provider: Provider) {
        let Some(item_hub) = runtime.item_hub.clone() else { return };
        let stores = self.stores.clone();
        tokio::spawn(async move {
            let (mut rx, _cancel) = item_hub.add(crate::model::LogStream::Combined);
            while let Some(item) = rx.recv().await {
                match crate::syncer::classify_item(provider, &item) {
                    Some(crate::syncer::ApprovalEvent::Requested { request_id, method, params }) => {
                        let approval = crate::model::Approval {
                            session_id: id.clone(),
                            request_id,
                            method,
                            params,
                            created_at: chrono::Utc::now(),
                        };
                        if let Err(e) = stores.approvals().upsert(&approval).await {
                            warn!(id = %id, err = %e, "failed to persist approval request");
                        }
                    }
                    Some(crate::syncer::ApprovalEvent::Resolved { request_id }) => {
                        if let Err(e) = stores.approvals().delete(&id, request_id).await {
                            warn!(id = %id, err = %e, "failed to clear resolved approval");
                        }
                    }
                    None => {}
                }
            }
        });
    }

    pub async fn send(&self, id: &str, payload: Value) -> Result<()> {
        let runtime = self
            .runtime(id)
            .await
            .ok_or_else(|| CoreError::session_not_found(id))?;
        let process = runtime
            .process
            .get()
            .context("session has no provider process")?
            .clone();
        process.send(payload).await
    }

    pub async fn interrupt(&self, id: &str) -> Result<()> {
        let runtime = self
            .runtime(id)
            .await
            .ok_or_else(|| CoreError::session_not_found(id))?;
        let process = runtime
            .process
            .get()
            .context("session has no provider process")?
            .clone();
        process.interrupt().await
    }

    /// Kill(id): cooperative interrupt, then a SIGTERM/SIGKILL ladder driven
    /// through `ProviderProcess::kill`, which each runtime implements with
    /// its own termination semantics.
    pub async fn kill(&self, id: &str) -> Result<()> {
        let runtime = self
            .runtime(id)
            .await
            .ok_or_else(|| CoreError::session_not_found(id))?;
        runtime.killed.store(true, std::sync::atomic::Ordering::SeqCst);
        let process = runtime
            .process
            .get()
            .context("session has no provider process")?
            .clone();

        let _ = process.interrupt().await;
        if tokio::time::timeout(KILL_COOPERATIVE_WAIT, runtime.wait_done())
            .await
            .is_ok()
        {
            return Ok(());
        }
        let _ = process.kill().await;
        if tokio::time::timeout(KILL_SIGTERM_WAIT, runtime.wait_done())
            .await
            .is_ok()
        {
            return Ok(());
        }
        let _ = process.kill().await;
        Ok(())
    }

    /// MarkExited: only permitted when the session is already inactive, or
    /// when the provider never had a supervised process to begin with.
    pub async fn mark_exited(&self, id: &str) -> Result<()> {
        let runtime = self
            .runtime(id)
            .await
            .ok_or_else(|| CoreError::session_not_found(id))?;
        let status = runtime.session.read().await.status;
        if status != Status::Inactive && !runtime.no_process {
            bail!(CoreError::Conflict(format!(
                "session {id} is not inactive and has a supervised process"
            )));
        }
        let mut guard = runtime.session.write().await;
        guard.status = Status::Exited;
        guard.exited_at = Some(chrono::Utc::now());
        let record = SessionRecord {
            session: guard.clone(),
            source: RecordSource::Internal,
        };
        drop(guard);
        self.stores.sessions().upsert(&record).await
    }

    /// Rekey (held conceptually under the map lock — callers only invoke
    /// this from within `start`, before the runtime is externally visible
    /// under its final id): renames the log directory, migrates the meta and
    /// index records, and swaps the map entry.
    async fn rekey(&self, old_id: &str, new_id: &str, runtime: Arc<Runtime>) -> Result<String> {
        {
            let mut guard = runtime.session.write().await;
            guard.id = new_id.to_string();
        }

        let old_dir = self.session_dir(old_id);
        let new_dir = self.session_dir(new_id);
        if !tokio::fs::try_exists(&new_dir).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::rename(&old_dir, &new_dir).await {
                warn!(old_id, new_id, err = %e, "rekey directory rename failed");
            }
        }

        if let Some(mut meta) = self.stores.meta().get(old_id).await? {
            let title_locked = meta.title_locked;
            meta.session_id = new_id.to_string();
            if meta.thread_id.is_none() {
                meta.thread_id = Some(new_id.to_string());
            }
            meta.title_locked = title_locked;
            self.stores.meta().upsert(&meta).await?;
            self.stores.meta().delete(old_id).await?;
        }

        if let Some(record) = self.stores.sessions().get(old_id).await? {
            let mut session = record.session;
            session.id = new_id.to_string();
            self.stores
                .sessions()
                .upsert(&SessionRecord { session, source: record.source })
                .await?;
            self.stores.sessions().delete(old_id).await?;
        }

        let mut map = self.runtimes.write().await;
        map.remove(old_id);
        map.insert(new_id.to_string(), runtime);

        info!(old_id, new_id, "session rekeyed");
        Ok(new_id.to_string())
    }

    /// Graceful shutdown: stops every live runtime with a bounded timeout,
    /// exercising the Kill ladder for each still-running session instead of
    /// abandoning subprocesses on daemon exit.
    pub async fn drain(&self) {
        let ids: Vec<String> = { self.runtimes.read().await.keys().cloned().collect() };
        for id in ids {
            let result = tokio::time::timeout(Duration::from_secs(5), self.kill(&id)).await;
            if result.is_err() {
                warn!(id = %id, "session did not stop within 5s during drain");
            }
        }
        info!("all active sessions drained");
    }
}
