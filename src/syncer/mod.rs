//! SessionSyncer & approval reconciliation (C7).
//!
//! `CodexSyncer` walks registered workspaces and reconciles codex-sourced
//! index records against the provider's own thread list, grounded on
//! `ThreadManager`'s `HashMap<ThreadId, ..>` of known threads (here, the
//! known set lives in the session store rather than in memory). The
//! periodic-scan scaffolding is grounded on `drift::background::spawn`'s
//! interval loop with a skipped first tick.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::manager::SessionManager;
use crate::model::{Item, Provider, RecordSource, Session, SessionMeta, SessionRecord, Status};
use crate::providers::codex::CodexProcess;
use crate::providers::opencode::OpenCodeProcess;
use crate::store::Stores;

const SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const THREAD_LIST_TIMEOUT: Duration = Duration::from_secs(20);

// ─── Push path: classify items as they're emitted, live ─────────────────────

/// What a freshly-emitted item means for the approval store.
pub enum ApprovalEvent {
    Requested { request_id: u64, method: String, params: Value },
    Resolved { request_id: u64 },
}

/// Classifies an item emitted for a session into an approval store mutation,
/// or `None` if it isn't approval-related. Codex items carry the JSON-RPC
/// method in `type` (per `CodexProcess::handle_line`); OpenCode items are the
/// raw upstream SSE payload, expected to carry a `permission` object with an
/// `id` and a `status`.
pub fn classify_item(provider: Provider, item: &Item) -> Option<ApprovalEvent> {
    match provider {
        Provider::Codex => classify_codex_item(item),
        Provider::Opencode | Provider::Kilocode => classify_opencode_item(item),
        Provider::Claude | Provider::Custom => None,
    }
}

fn classify_codex_item(item: &Item) -> Option<ApprovalEvent> {
    let method = item.get("type")?.as_str()?;
    let params = item.get("params").cloned().unwrap_or(Value::Null);
    let is_request = method.ends_with("requestApproval") || method == "tool/requestUserInput";
    if is_request {
        let request_id = params.get("requestId").and_then(Value::as_u64)?;
        return Some(ApprovalEvent::Requested {
            request_id,
            method: method.to_string(),
            params,
        });
    }
    if params.get("decision").is_some() {
        let request_id = params.get("requestId").and_then(Value::as_u64)?;
        return Some(ApprovalEvent::Resolved { request_id });
    }
    None
}

fn classify_opencode_item(item: &Item) -> Option<ApprovalEvent> {
    let kind = item.get("type").and_then(Value::as_str).unwrap_or_default();
    if !kind.starts_with("permission") {
        return None;
    }
    let perm = item.get("permission")?;
    let id = perm.get("id").and_then(Value::as_str)?;
    let request_id = derive_request_id(id);
    let status = perm.get("status").and_then(Value::as_str).unwrap_or("pending");
    if status == "pending" {
        Some(ApprovalEvent::Requested {
            request_id,
            method: "permission".to_string(),
            params: perm.clone(),
        })
    } else {
        Some(ApprovalEvent::Resolved { request_id })
    }
}

/// Derives a stable `u64` request id from an upstream string id (e.g.
/// OpenCode's `"P-42"`) via FNV-1a — `DefaultHasher` is randomized per
/// process and unsuitable for a value that must match across resync passes.
pub fn derive_request_id(s: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in s.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

// ─── Pull path: opportunistic resync before listing approvals ───────────────

/// Re-reads the provider's own authoritative state and reconciles the local
/// approval store against it (spec §4.7). A no-op for providers with no
/// resyncer (Claude, Custom).
pub async fn resync_approvals(manager: &Arc<SessionManager>, stores: &Stores, session_id: &str) -> Result<()> {
    let record = stores
        .sessions()
        .get(session_id)
        .await?
        .context("session not found")?;

    match record.session.provider {
        Provider::Codex => resync_codex_approvals(manager, stores, session_id).await,
        Provider::Opencode | Provider::Kilocode => resync_opencode_approvals(manager, stores, session_id).await,
        Provider::Claude | Provider::Custom => Ok(()),
    }
}

async fn resync_codex_approvals(manager: &Arc<SessionManager>, stores: &Stores, session_id: &str) -> Result<()> {
    let Some(runtime) = manager.runtime(session_id).await else {
        return Ok(());
    };
    let Some(process) = runtime.process() else {
        return Ok(());
    };
    let Some(codex) = process.as_any().downcast_ref::<CodexProcess>() else {
        return Ok(());
    };
    let Some(thread_id) = codex.thread_id_string().await else {
        return Ok(());
    };

    let result = codex.call("thread/read", json!({ "threadId": thread_id })).await?;
    let turns = result.get("turns").and_then(Value::as_array).cloned().unwrap_or_default();

    let mut live = Vec::new();
    let mut resolved = std::collections::HashSet::new();
    for turn in &turns {
        let Some(method) = turn.get("type").and_then(Value::as_str) else { continue };
        let params = turn.get("params").cloned().unwrap_or(Value::Null);
        if params.get("decision").is_some() {
            if let Some(id) = params.get("requestId").and_then(Value::as_u64) {
                resolved.insert(id);
            }
            continue;
        }
        if method.ends_with("requestApproval") || method == "tool/requestUserInput" {
            if let Some(id) = params.get("requestId").and_then(Value::as_u64) {
                live.push((id, method.to_string(), params));
            }
        }
    }

    let live_ids: Vec<u64> = live
        .iter()
        .map(|(id, ..)| *id)
        .filter(|id| !resolved.contains(id))
        .collect();
    for (id, method, params) in live {
        if resolved.contains(&id) {
            continue;
        }
        let approval = crate::model::Approval {
            session_id: session_id.to_string(),
            request_id: id,
            method,
            params,
            created_at: chrono::Utc::now(),
        };
        stores.approvals().upsert(&approval).await?;
    }
    stores.approvals().reconcile(session_id, &live_ids).await
}

async fn resync_opencode_approvals(manager: &Arc<SessionManager>, stores: &Stores, session_id: &str) -> Result<()> {
    let Some(runtime) = manager.runtime(session_id).await else {
        return Ok(());
    };
    let Some(process) = runtime.process() else {
        return Ok(());
    };
    let Some(opencode) = process.as_any().downcast_ref::<OpenCodeProcess>() else {
        return Ok(());
    };

    let permissions = opencode.list_permissions().await?;
    let mut live_ids = Vec::with_capacity(permissions.len());
    for perm in permissions {
        let Some(id) = perm.get("id").and_then(Value::as_str) else { continue };
        let request_id = derive_request_id(id);
        live_ids.push(request_id);
        let approval = crate::model::Approval {
            session_id: session_id.to_string(),
            request_id,
            method: "permission".to_string(),
            params: perm,
            created_at: chrono::Utc::now(),
        };
        stores.approvals().upsert(&approval).await?;
    }
    stores.approvals().reconcile(session_id, &live_ids).await
}

// ─── CodexSyncer: workspace walk + thread discovery ──────────────────────────

#[derive(Deserialize)]
struct WorkspaceRecord {
    id: String,
    path: String,
}

#[derive(Deserialize)]
struct WorktreeRecord {
    id: String,
    workspace_id: String,
    path: String,
}

/// Spawn the 24h background Codex sync scan.
pub fn spawn(manager: Arc<SessionManager>, stores: Stores, codex_cmd: String) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SYNC_INTERVAL);
        interval.tick().await; // skip the immediate first tick — don't scan on startup
        loop {
            interval.tick().await;
            if let Err(e) = sync_all_workspaces(&manager, &stores, &codex_cmd).await {
                warn!(err = %e, "codex workspace sync failed");
            }
        }
    });
}

/// Walks every registered workspace (and its worktrees) and reconciles
/// codex-sourced session records against each workspace's live thread list.
pub async fn sync_all_workspaces(manager: &Arc<SessionManager>, stores: &Stores, codex_cmd: &str) -> Result<()> {
    let workspaces: Vec<WorkspaceRecord> = stores
        .kv()
        .list("workspaces")
        .await?
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();
    let worktrees: Vec<WorktreeRecord> = stores
        .kv()
        .list("worktrees")
        .await?
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();

    for workspace in &workspaces {
        let own_worktrees: Vec<&WorktreeRecord> =
            worktrees.iter().filter(|w| w.workspace_id == workspace.id).collect();
        if own_worktrees.is_empty() {
            sync_workspace(manager, stores, codex_cmd, Path::new(&workspace.path), &workspace.id, None).await;
        }
        for worktree in own_worktrees {
            sync_workspace(
                manager,
                stores,
                codex_cmd,
                Path::new(&worktree.path),
                &workspace.id,
                Some(&worktree.id),
            )
            .await;
        }
    }
    Ok(())
}

async fn sync_workspace(
    manager: &Arc<SessionManager>,
    stores: &Stores,
    codex_cmd: &str,
    root: &Path,
    workspace_id: &str,
    worktree_id: Option<&str>,
) {
    let threads = match list_threads(codex_cmd, root).await {
        Ok(t) => t,
        Err(e) => {
            warn!(root = %root.display(), err = %e, "codex thread/list failed during sync");
            return;
        }
    };

    let mut seen = std::collections::HashSet::new();
    for thread in threads {
        let Some(thread_id) = thread.get("id").and_then(Value::as_str) else { continue };
        let thread_cwd = thread.get("cwd").and_then(Value::as_str).unwrap_or_default();
        if Path::new(thread_cwd) != root {
            continue;
        }
        seen.insert(thread_id.to_string());

        if let Err(e) =
            upsert_codex_thread(manager, stores, thread_id, thread_cwd, &thread, workspace_id, worktree_id).await
        {
            warn!(thread_id, err = %e, "failed to upsert synced codex session");
        }
    }

    if let Err(e) = remove_stale_codex_records(stores, root, workspace_id, worktree_id, &seen).await {
        warn!(root = %root.display(), err = %e, "failed to remove stale codex records");
    }
}

async fn upsert_codex_thread(
    manager: &Arc<SessionManager>,
    stores: &Stores,
    thread_id: &str,
    cwd: &str,
    thread: &Value,
    workspace_id: &str,
    worktree_id: Option<&str>,
) -> Result<()> {
    if manager.runtime(thread_id).await.is_some() {
        return Ok(());
    }
    let existing = stores.sessions().get(thread_id).await?;
    if let Some(existing) = &existing {
        if existing.session.status.is_terminal() {
            return Ok(());
        }
    }

    let title = thread
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(thread_id)
        .to_string();
    let now = chrono::Utc::now();
    let session = Session {
        id: thread_id.to_string(),
        provider: Provider::Codex,
        cwd: cwd.to_string(),
        cmd: String::new(),
        args: Vec::new(),
        env: Vec::new(),
        status: Status::Inactive,
        created_at: existing.as_ref().map(|e| e.session.created_at).unwrap_or(now),
        started_at: None,
        exited_at: None,
        pid: None,
        exit_code: None,
        title,
        tags: Vec::new(),
    };
    stores
        .sessions()
        .upsert(&SessionRecord { session, source: RecordSource::Codex })
        .await?;

    let mut meta = stores
        .meta()
        .get(thread_id)
        .await?
        .unwrap_or_else(|| SessionMeta::new(thread_id.to_string()));
    meta.thread_id = Some(thread_id.to_string());
    meta.workspace_id = Some(workspace_id.to_string());
    meta.worktree_id = worktree_id.map(str::to_string);
    meta.last_active_at = now;
    stores.meta().upsert(&meta).await
}

/// Removes codex-sourced records under this workspace/worktree whose thread
/// id wasn't in the latest listing. Internal sessions are never touched.
async fn remove_stale_codex_records(
    stores: &Stores,
    root: &Path,
    workspace_id: &str,
    worktree_id: Option<&str>,
    seen: &std::collections::HashSet<String>,
) -> Result<()> {
    let root_str = root.to_string_lossy();
    for record in stores.sessions().list_by_source(RecordSource::Codex).await? {
        if record.session.cwd != root_str {
            continue;
        }
        if seen.contains(&record.session.id) {
            continue;
        }
        let meta = stores.meta().get(&record.session.id).await?;
        let matches_scope = meta
            .map(|m| m.workspace_id.as_deref() == Some(workspace_id) && m.worktree_id.as_deref() == worktree_id)
            .unwrap_or(true);
        if !matches_scope {
            continue;
        }
        stores.sessions().delete(&record.session.id).await?;
        stores.meta().delete(&record.session.id).await?;
    }
    Ok(())
}

/// Spawns a short-lived `codex app-server` in `cwd`, issues `thread/list`,
/// and returns the raw thread array. The process is killed once the
/// response arrives — this is a one-shot listing, not a supervised runtime.
async fn list_threads(cmd: &str, cwd: &Path) -> Result<Vec<Value>> {
    tokio::time::timeout(THREAD_LIST_TIMEOUT, list_threads_inner(cmd, cwd))
        .await
        .context("codex thread/list timed out")?
}

async fn list_threads_inner(cmd: &str, cwd: &Path) -> Result<Vec<Value>> {
    let mut child = Command::new(cmd)
        .arg("app-server")
        .current_dir(cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn `{cmd} app-server` for sync"))?;

    let mut stdin = child.stdin.take().context("no stdin")?;
    let stdout = child.stdout.take().context("no stdout")?;
    let mut lines = BufReader::new(stdout).lines();

    let request = json!({ "jsonrpc": "2.0", "id": 1, "method": "thread/list", "params": {} });
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;

    let result = loop {
        let Some(line) = lines.next_line().await? else {
            anyhow::bail!("codex app-server closed stdout before thread/list responded");
        };
        let Ok(value) = serde_json::from_str::<Value>(&line) else { continue };
        if value.get("id").and_then(Value::as_u64) == Some(1) {
            break value.get("result").cloned().unwrap_or(Value::Null);
        }
    };

    let _ = child.kill().await;
    Ok(result.get("threads").and_then(Value::as_array).cloned().unwrap_or_default())
}

// ─── Legacy shape migration ───────────────────────────────────────────────────

/// Migrates two legacy record shapes (spec §4.7):
/// (a) codex "dual-entry" pairs — an internal session and a codex-sourced
///     session both pointing at the same thread — merged under the thread
///     id, preserving the internal session's locked title;
/// (b) legacy `orphaned`-status records, rewritten to `inactive`/`exited`
///     with `dismissed_at` populated in meta.
pub async fn migrate_legacy_records(stores: &Stores) -> Result<()> {
    let all = stores.sessions().list().await?;

    let mut by_thread: std::collections::HashMap<String, Vec<SessionRecord>> = std::collections::HashMap::new();
    for record in &all {
        if let Some(meta) = stores.meta().get(&record.session.id).await? {
            if let Some(tid) = meta.thread_id {
                by_thread.entry(tid).or_default().push(record.clone());
            }
        }
    }

    for (thread_id, mut group) in by_thread {
        if group.len() < 2 {
            continue;
        }
        group.sort_by_key(|r| r.source != RecordSource::Internal);
        let winner = group.remove(0);
        let mut winner_meta = stores
            .meta()
            .get(&winner.session.id)
            .await?
            .unwrap_or_else(|| SessionMeta::new(winner.session.id.clone()));

        for loser in group {
            if loser.session.id == winner.session.id {
                continue;
            }
            if let Some(loser_meta) = stores.meta().get(&loser.session.id).await? {
                if loser_meta.title_locked && !winner_meta.title_locked {
                    winner_meta.title_locked = true;
                }
            }
            stores.sessions().delete(&loser.session.id).await?;
            stores.meta().delete(&loser.session.id).await?;
        }

        winner_meta.thread_id = Some(thread_id);
        stores.meta().upsert(&winner_meta).await?;
    }

    for record in stores.sessions().list().await? {
        if record.session.status.as_str() != "orphaned" {
            continue;
        }
        let mut session = record.session;
        session.status = if session.exit_code.is_some() { Status::Exited } else { Status::Inactive };
        stores
            .sessions()
            .upsert(&SessionRecord { session: session.clone(), source: record.source })
            .await?;

        let mut meta = stores
            .meta()
            .get(&session.id)
            .await?
            .unwrap_or_else(|| SessionMeta::new(session.id.clone()));
        meta.dismissed_at = Some(chrono::Utc::now());
        stores.meta().upsert(&meta).await?;
    }

    info!("legacy record migration complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_request_id_is_stable() {
        assert_eq!(derive_request_id("P-42"), derive_request_id("P-42"));
        assert_ne!(derive_request_id("P-42"), derive_request_id("P-43"));
    }

    #[test]
    fn classify_codex_request_extracts_request_id() {
        let mut item = serde_json::Map::new();
        item.insert("type".into(), json!("item/commandExecution/requestApproval"));
        item.insert("params".into(), json!({ "requestId": 7 }));
        match classify_item(Provider::Codex, &item) {
            Some(ApprovalEvent::Requested { request_id, .. }) => assert_eq!(request_id, 7),
            _ => panic!("expected a Requested event"),
        }
    }

    #[test]
    fn classify_opencode_pending_permission_is_a_request() {
        let mut item = serde_json::Map::new();
        item.insert("type".into(), json!("permission.updated"));
        item.insert("permission".into(), json!({ "id": "P-42", "status": "pending" }));
        match classify_item(Provider::Opencode, &item) {
            Some(ApprovalEvent::Requested { request_id, .. }) => {
                assert_eq!(request_id, derive_request_id("P-42"))
            }
            _ => panic!("expected a Requested event"),
        }
    }

    /// The stored params must carry the upstream permission id under `id` —
    /// `OpenCodeAdapter::approve` reads `approval.params["id"]` to call
    /// `ReplyPermission`, not `permissionId`.
    #[test]
    fn classify_opencode_request_params_carry_permission_id_under_id() {
        let mut item = serde_json::Map::new();
        item.insert("type".into(), json!("permission.updated"));
        item.insert("permission".into(), json!({ "id": "P-42", "status": "pending" }));
        match classify_item(Provider::Opencode, &item) {
            Some(ApprovalEvent::Requested { params, .. }) => {
                assert_eq!(params.get("id").and_then(Value::as_str), Some("P-42"));
                assert!(params.get("permissionId").is_none());
            }
            _ => panic!("expected a Requested event"),
        }
    }
}
