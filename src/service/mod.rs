//! SessionService (C6): stateless façade over the persisted stores, the
//! `SessionManager`, and the `ConversationAdapter` registry.
//!
//! Grounded on `session::SessionManager`'s public-facing methods being a
//! thin wrapper over its internal map plus the storage layer — here that
//! wrapper is pulled out into its own type since the internal map (`C4`) and
//! the adapter dispatch (`C5`) are now separate collaborators.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::adapters::{self, ApprovalDecision, ConversationAdapter};
use crate::config::{self, DaemonConfig};
use crate::error::CoreError;
use crate::hub::CancelHandle;
use crate::manager::{SessionManager, StartRequest};
use crate::model::{
    Approval, DebugEvent, Item, LogEvent, LogStream, Provider, RuntimeOptions, Session,
    SessionMeta, SessionRecord, Status,
};
use crate::store::Stores;

pub struct SessionWithMeta {
    pub record: SessionRecord,
    pub meta: SessionMeta,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub include_dismissed: bool,
    pub include_workflow_owned: bool,
}

pub struct StartSessionRequest {
    pub provider: Provider,
    pub cwd: Option<String>,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub title: String,
    pub workspace_root: Option<PathBuf>,
    pub workspace_id: Option<String>,
    pub worktree_id: Option<String>,
    pub initial_input: Option<String>,
}

/// At least one field must be `Some`.
#[derive(Debug, Clone, Default)]
pub struct UpdateSessionRequest {
    pub title: Option<String>,
    pub runtime_options: Option<RuntimeOptions>,
    pub notification_overrides: Option<HashMap<String, bool>>,
}

pub struct SessionService {
    manager: Arc<SessionManager>,
    stores: Stores,
    config: DaemonConfig,
}

impl SessionService {
    pub fn new(manager: Arc<SessionManager>, stores: Stores, config: DaemonConfig) -> Self {
        Self { manager, stores, config }
    }

    fn adapter(&self, provider: Provider) -> Arc<dyn ConversationAdapter> {
        adapters::resolve(provider, self.manager.clone(), self.stores.clone())
    }

    async fn touch_meta(&self, session_id: &str) -> Result<()> {
        if let Some(mut meta) = self.stores.meta().get(session_id).await? {
            meta.last_active_at = chrono::Utc::now();
            self.stores.meta().upsert(&meta).await?;
        }
        Ok(())
    }

    /// A `running` record whose runtime is gone and whose provider supervises
    /// a real process is stale — rewrites it to `inactive` in place.
    async fn normalize_status(&self, record: &mut SessionRecord) -> Result<bool> {
        if record.session.status != Status::Running {
            return Ok(false);
        }
        if self.manager.runtime(&record.session.id).await.is_some() {
            return Ok(false);
        }
        let caps = crate::providers::resolve(record.session.provider).capabilities();
        if caps.no_process {
            return Ok(false);
        }
        record.session.status = Status::Inactive;
        self.stores.sessions().upsert(record).await?;
        Ok(true)
    }

    /// ListWithMeta (spec §4.6): normalizes stuck statuses, dedupes by
    /// `(provider=codex => threadId else sessionId)`, and keeps the best
    /// candidate per key by the ordered tie-break: live > source priority >
    /// status priority > last-active > createdAt > id.
    pub async fn list_with_meta(&self, opts: ListOptions) -> Result<Vec<SessionWithMeta>> {
        let mut records = self.stores.sessions().list().await?;
        for record in &mut records {
            self.normalize_status(record).await?;
        }

        let metas = self.stores.meta().list().await?;
        let mut meta_by_id: HashMap<String, SessionMeta> =
            metas.into_iter().map(|m| (m.session_id.clone(), m)).collect();

        let mut liveness = HashMap::new();
        for record in &records {
            let live = self.manager.runtime(&record.session.id).await.is_some();
            liveness.insert(record.session.id.clone(), live);
        }

        let mut groups: HashMap<String, Vec<SessionRecord>> = HashMap::new();
        for record in records {
            let meta = meta_by_id.get(&record.session.id);
            let key = dedup_key(&record.session, meta);
            groups.entry(key).or_default().push(record);
        }

        let mut out = Vec::with_capacity(groups.len());
        for (_, mut candidates) in groups {
            candidates.sort_by(|a, b| {
                rank(b, &liveness, &meta_by_id).cmp(&rank(a, &liveness, &meta_by_id))
            });
            if let Some(best) = candidates.into_iter().next() {
                let meta = meta_by_id
                    .remove(&best.session.id)
                    .unwrap_or_else(|| SessionMeta::new(best.session.id.clone()));
                out.push(SessionWithMeta { record: best, meta });
            }
        }

        out.retain(|s| !matches!(s.record.session.status, Status::Failed | Status::Killed));
        out.retain(|s| opts.include_dismissed || s.meta.dismissed_at.is_none());

        // A workflow-owned session is still listable if it's the canonical
        // session of its run — the one the run considers its "main" thread.
        // There's no WorkflowRun store here (out of scope, per spec §1), so
        // canonical is taken to mean the earliest-created session sharing
        // that run id, mirroring the createdAt tie-break `rank` already uses
        // for dedup below.
        let mut canonical_by_run: HashMap<String, (chrono::DateTime<chrono::Utc>, String)> = HashMap::new();
        for s in &out {
            if let Some(run_id) = &s.meta.workflow_run_id {
                let created = s.record.session.created_at;
                let id = s.record.session.id.clone();
                canonical_by_run
                    .entry(run_id.clone())
                    .and_modify(|(best_created, best_id)| {
                        if created < *best_created {
                            *best_created = created;
                            *best_id = id.clone();
                        }
                    })
                    .or_insert((created, id));
            }
        }
        let canonical_ids: std::collections::HashSet<String> =
            canonical_by_run.into_values().map(|(_, id)| id).collect();

        out.retain(|s| {
            opts.include_workflow_owned
                || s.meta.workflow_run_id.is_none()
                || canonical_ids.contains(&s.record.session.id)
        });

        out.sort_by(|a, b| b.meta.last_active_at.cmp(&a.meta.last_active_at));
        Ok(out)
    }

    /// Start (spec §4.6): sanitizes the title, resolves `codexHome` for
    /// Codex, and — for Claude/OpenCode — defers the initial send to a
    /// detached task so a slow provider call can't delay the response.
    pub async fn start(&self, req: StartSessionRequest) -> Result<SessionRecord> {
        let sanitized_title = sanitize_title(&req.title);
        if !req.title.trim().is_empty() && sanitized_title.is_empty() {
            bail!(CoreError::Invalid("title sanitizes to empty".into()));
        }

        if self.config.max_sessions > 0
            && self.manager.active_count().await >= self.config.max_sessions
        {
            bail!(CoreError::Conflict("max_sessions limit reached".into()));
        }

        let cwd = crate::worktree::resolve_cwd(
            &self.stores,
            req.cwd.as_deref(),
            req.workspace_id.as_deref(),
            req.worktree_id.as_deref(),
        )
        .await
        .map_err(|e| CoreError::Invalid(e.to_string()))?;

        let codex_home = if req.provider == Provider::Codex {
            Some(config::codex_home(Path::new(&cwd), req.workspace_root.as_deref())?)
        } else {
            None
        };
        let profile = self.config.provider_profile(req.provider.as_str()).cloned();

        let defers_initial_send = matches!(req.provider, Provider::Claude | Provider::Opencode | Provider::Kilocode);
        let (start_initial, deferred_initial) = if defers_initial_send {
            (None, req.initial_input.clone())
        } else {
            (req.initial_input.clone(), None)
        };

        let record = self
            .manager
            .start(StartRequest {
                reuse_id: None,
                provider: req.provider,
                cwd,
                cmd: req.cmd,
                args: req.args,
                env: req.env,
                title: sanitized_title,
                codex_home,
                initial_input: start_initial,
                profile,
                resume_provider_session_id: None,
            })
            .await?;

        let id = record.session.id.clone();
        let mut meta = self
            .stores
            .meta()
            .get(&id)
            .await?
            .unwrap_or_else(|| SessionMeta::new(id.clone()));
        meta.workspace_id = req.workspace_id;
        meta.worktree_id = req.worktree_id;
        meta.initial_input = req.initial_input;
        meta.last_active_at = chrono::Utc::now();
        self.stores.meta().upsert(&meta).await?;

        if let Some(text) = deferred_initial {
            let adapter = self.adapter(req.provider);
            let session_id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = adapter.send_message(&session_id, &text).await {
                    warn!(id = %session_id, err = %e, "deferred initial send failed");
                }
            });
        }

        Ok(record)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionWithMeta>> {
        let Some(mut record) = self.stores.sessions().get(session_id).await? else {
            return Ok(None);
        };
        self.normalize_status(&mut record).await?;
        let meta = self
            .stores
            .meta()
            .get(session_id)
            .await?
            .unwrap_or_else(|| SessionMeta::new(session_id.to_string()));
        Ok(Some(SessionWithMeta { record, meta }))
    }

    pub async fn update_title(&self, session_id: &str, title: &str) -> Result<()> {
        self.update(
            session_id,
            UpdateSessionRequest { title: Some(title.to_string()), ..Default::default() },
        )
        .await
    }

    pub async fn update(&self, session_id: &str, req: UpdateSessionRequest) -> Result<()> {
        if req.title.is_none() && req.runtime_options.is_none() && req.notification_overrides.is_none() {
            bail!(CoreError::Invalid("at least one field must be set".into()));
        }

        if let Some(title) = &req.title {
            let sanitized = sanitize_title(title);
            if !title.trim().is_empty() && sanitized.is_empty() {
                bail!(CoreError::Invalid("title sanitizes to empty".into()));
            }
            let mut record = self
                .stores
                .sessions()
                .get(session_id)
                .await?
                .ok_or_else(|| CoreError::session_not_found(session_id))?;
            record.session.title = sanitized;
            self.stores.sessions().upsert(&record).await?;

            let mut meta = self
                .stores
                .meta()
                .get(session_id)
                .await?
                .unwrap_or_else(|| SessionMeta::new(session_id.to_string()));
            meta.title_locked = true;
            self.stores.meta().upsert(&meta).await?;
        }

        if req.runtime_options.is_some() || req.notification_overrides.is_some() {
            let mut meta = self
                .stores
                .meta()
                .get(session_id)
                .await?
                .ok_or_else(|| CoreError::session_not_found(session_id))?;
            if let Some(opts) = req.runtime_options {
                meta.runtime_options = opts;
            }
            if let Some(overrides) = req.notification_overrides {
                meta.notification_overrides = overrides;
            }
            self.stores.meta().upsert(&meta).await?;
        }

        self.touch_meta(session_id).await
    }

    pub async fn mark_exited(&self, session_id: &str) -> Result<()> {
        self.manager.mark_exited(session_id).await?;
        self.touch_meta(session_id).await
    }

    pub async fn kill(&self, session_id: &str) -> Result<()> {
        self.manager.kill(session_id).await?;
        self.touch_meta(session_id).await
    }

    pub async fn dismiss(&self, session_id: &str) -> Result<()> {
        let mut meta = self
            .stores
            .meta()
            .get(session_id)
            .await?
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        meta.dismissed_at = Some(chrono::Utc::now());
        self.stores.meta().upsert(&meta).await
    }

    pub async fn undismiss(&self, session_id: &str) -> Result<()> {
        let mut meta = self
            .stores
            .meta()
            .get(session_id)
            .await?
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        meta.dismissed_at = None;
        self.stores.meta().upsert(&meta).await
    }

    async fn provider_of(&self, session_id: &str) -> Result<Provider> {
        let record = self
            .stores
            .sessions()
            .get(session_id)
            .await?
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        Ok(record.session.provider)
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<Item>> {
        let provider = self.provider_of(session_id).await?;
        self.adapter(provider).history(session_id).await
    }

    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<Option<String>> {
        let provider = self.provider_of(session_id).await?;
        let turn_id = self.adapter(provider).send_message(session_id, text).await?;
        self.touch_meta(session_id).await?;
        Ok(turn_id)
    }

    pub async fn send_message_with_options(
        &self,
        session_id: &str,
        text: &str,
        options: RuntimeOptions,
    ) -> Result<Option<String>> {
        let mut meta = self
            .stores
            .meta()
            .get(session_id)
            .await?
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        meta.runtime_options = options;
        self.stores.meta().upsert(&meta).await?;
        self.send_message(session_id, text).await
    }

    pub async fn approve(&self, session_id: &str, request_id: u64, decision: ApprovalDecision) -> Result<()> {
        let provider = self.provider_of(session_id).await?;
        self.adapter(provider).approve(session_id, request_id, decision).await?;
        self.touch_meta(session_id).await
    }

    /// ListApprovals; `resync` triggers an opportunistic resync against the
    /// provider before returning, reconciling deletions when the provider's
    /// listing is authoritative (§4.7).
    pub async fn list_approvals(&self, session_id: &str, resync: bool) -> Result<Vec<Approval>> {
        if resync {
            if let Err(e) = crate::syncer::resync_approvals(&self.manager, &self.stores, session_id).await {
                warn!(id = %session_id, err = %e, "approval resync failed, serving local state");
            }
        }
        self.stores.approvals().list_for_session(session_id).await
    }

    pub async fn interrupt_turn(&self, session_id: &str) -> Result<()> {
        let provider = self.provider_of(session_id).await?;
        self.adapter(provider).interrupt(session_id).await
    }

    pub async fn subscribe(
        &self,
        session_id: &str,
        stream: LogStream,
    ) -> Result<(mpsc::Receiver<LogEvent>, CancelHandle<LogEvent>)> {
        let runtime = self
            .manager
            .runtime(session_id)
            .await
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        Ok(runtime.log_hub.add(stream))
    }

    pub async fn subscribe_events(&self, session_id: &str) -> Result<mpsc::Receiver<Item>> {
        let provider = self.provider_of(session_id).await?;
        self.adapter(provider).subscribe_events(session_id).await
    }

    /// SubscribeItems: returns a disk-backed snapshot prefix (everything
    /// written to `items.jsonl` so far) plus the live channel.
    pub async fn subscribe_items(
        &self,
        session_id: &str,
    ) -> Result<(Vec<Item>, mpsc::Receiver<Item>, CancelHandle<Item>)> {
        let runtime = self
            .manager
            .runtime(session_id)
            .await
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        let item_hub = runtime.item_hub.clone().context("session emits no items")?;
        let snapshot = self.tail_items(session_id).await.unwrap_or_default();
        let (rx, cancel) = item_hub.add(LogStream::Combined);
        Ok((snapshot, rx, cancel))
    }

    pub async fn read_debug(&self, session_id: &str, n: usize) -> Result<Vec<DebugEvent>> {
        let runtime = self
            .manager
            .runtime(session_id)
            .await
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        Ok(runtime.debug_sink.buffer.snapshot(n))
    }

    pub async fn subscribe_debug(
        &self,
        session_id: &str,
    ) -> Result<(mpsc::Receiver<DebugEvent>, CancelHandle<DebugEvent>)> {
        let runtime = self
            .manager
            .runtime(session_id)
            .await
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        Ok(runtime.debug_hub.add(LogStream::Combined))
    }

    /// One-shot read of every item persisted so far for a session, live or
    /// not (used as the `SubscribeItems` snapshot prefix and by clients that
    /// only want a point-in-time dump).
    pub async fn tail_items(&self, session_id: &str) -> Result<Vec<Item>> {
        let path = self.manager.session_dir(session_id).join("items.jsonl");
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return Ok(Vec::new()),
        };
        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str::<Item>(line).ok())
            .collect())
    }
}

fn dedup_key(session: &Session, meta: Option<&SessionMeta>) -> String {
    if session.provider == Provider::Codex {
        if let Some(tid) = meta.and_then(|m| m.thread_id.clone()) {
            return tid;
        }
    }
    session.id.clone()
}

/// Tie-break rank for dedup (spec §4.6): live > source priority > status
/// priority > last-active > createdAt > id, compared in this field order.
fn rank(
    record: &SessionRecord,
    liveness: &HashMap<String, bool>,
    metas: &HashMap<String, SessionMeta>,
) -> (bool, u8, u8, i64, i64, std::cmp::Reverse<String>) {
    let live = liveness.get(&record.session.id).copied().unwrap_or(false);
    let source_priority = Provider::source_priority(&record.source);
    let status_priority = record.session.status.priority();
    let last_active = metas
        .get(&record.session.id)
        .map(|m| m.last_active_at)
        .unwrap_or(record.session.created_at)
        .timestamp_micros();
    let created_at = record.session.created_at.timestamp_micros();
    (
        live,
        source_priority,
        status_priority,
        last_active,
        created_at,
        std::cmp::Reverse(record.session.id.clone()),
    )
}

/// Trims whitespace, strips control characters, and caps length at 256
/// chars (spec §4.6 rejects titles that sanitize to empty).
fn sanitize_title(raw: &str) -> String {
    let collapsed: String = raw.chars().filter(|c| !c.is_control()).collect();
    collapsed.trim().chars().take(256).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_title_strips_control_chars_and_trims() {
        assert_eq!(sanitize_title("  hello\u{0}world  "), "helloworld");
    }

    #[test]
    fn sanitize_title_caps_length() {
        let long = "a".repeat(300);
        assert_eq!(sanitize_title(&long).chars().count(), 256);
    }

    #[test]
    fn sanitize_title_of_only_whitespace_is_empty() {
        assert_eq!(sanitize_title("   "), "");
    }
}
