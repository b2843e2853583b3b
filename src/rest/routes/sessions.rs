//! Session CRUD & lifecycle routes (spec §6): list, start, get, patch,
//! dismiss/undismiss, kill, mark-exited, history, send, interrupt.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::model::{Provider, RuntimeOptions};
use crate::service::{ListOptions, SessionWithMeta, StartSessionRequest, UpdateSessionRequest};
use crate::AppContext;

fn session_json(s: &SessionWithMeta) -> Value {
    json!({
        "id": s.record.session.id,
        "provider": s.record.session.provider.as_str(),
        "cwd": s.record.session.cwd,
        "status": s.record.session.status.as_str(),
        "title": s.record.session.title,
        "createdAt": s.record.session.created_at,
        "startedAt": s.record.session.started_at,
        "exitedAt": s.record.session.exited_at,
        "pid": s.record.session.pid,
        "exitCode": s.record.session.exit_code,
        "workspaceId": s.meta.workspace_id,
        "worktreeId": s.meta.worktree_id,
        "threadId": s.meta.thread_id,
        "lastActiveAt": s.meta.last_active_at,
        "dismissedAt": s.meta.dismissed_at,
        "runtimeOptions": s.meta.runtime_options,
    })
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    include_dismissed: bool,
    #[serde(default)]
    include_workflow_owned: bool,
    #[serde(default)]
    refresh: bool,
    workspace_id: Option<String>,
}

pub async fn list(State(ctx): State<Arc<AppContext>>, Query(q): Query<ListQuery>) -> CoreResult<Json<Value>> {
    if q.refresh {
        if let Err(e) = crate::syncer::sync_all_workspaces(&ctx.manager, &ctx.stores, "codex").await {
            tracing::warn!(err = %e, "on-demand workspace refresh failed");
        }
    }

    let opts = ListOptions {
        include_dismissed: q.include_dismissed,
        include_workflow_owned: q.include_workflow_owned,
    };
    let mut sessions = ctx.service.list_with_meta(opts).await?;
    if let Some(workspace_id) = &q.workspace_id {
        sessions.retain(|s| s.meta.workspace_id.as_deref() == Some(workspace_id.as_str()));
    }
    Ok(Json(json!({ "sessions": sessions.iter().map(session_json).collect::<Vec<_>>() })))
}

#[derive(Deserialize)]
pub struct StartBody {
    provider: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    workspace_root: Option<std::path::PathBuf>,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    worktree_id: Option<String>,
    #[serde(default)]
    initial_input: Option<String>,
}

pub async fn start(State(ctx): State<Arc<AppContext>>, Json(body): Json<StartBody>) -> CoreResult<Json<Value>> {
    let provider = Provider::parse(&body.provider)
        .ok_or_else(|| CoreError::Invalid(format!("unknown provider: {}", body.provider)))?;
    let cmd = body.cmd.unwrap_or_else(|| provider.as_str().to_string());

    let record = ctx
        .service
        .start(StartSessionRequest {
            provider,
            cwd: body.cwd,
            cmd,
            args: body.args,
            env: body.env.into_iter().collect(),
            title: body.title,
            workspace_root: body.workspace_root,
            workspace_id: body.workspace_id,
            worktree_id: body.worktree_id,
            initial_input: body.initial_input,
        })
        .await?;

    let with_meta = ctx
        .service
        .get(&record.session.id)
        .await?
        .ok_or_else(|| CoreError::session_not_found(&record.session.id))?;
    Ok(Json(session_json(&with_meta)))
}

pub async fn get_one(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> CoreResult<Json<Value>> {
    let with_meta = ctx.service.get(&id).await?.ok_or_else(|| CoreError::session_not_found(&id))?;
    Ok(Json(session_json(&with_meta)))
}

#[derive(Deserialize, Default)]
pub struct PatchBody {
    title: Option<String>,
    runtime_options: Option<RuntimeOptions>,
    notification_overrides: Option<HashMap<String, bool>>,
}

pub async fn update(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>, Json(body): Json<PatchBody>) -> CoreResult<Json<Value>> {
    ctx.service
        .update(
            &id,
            UpdateSessionRequest {
                title: body.title,
                runtime_options: body.runtime_options,
                notification_overrides: body.notification_overrides,
            },
        )
        .await?;
    let with_meta = ctx.service.get(&id).await?.ok_or_else(|| CoreError::session_not_found(&id))?;
    Ok(Json(session_json(&with_meta)))
}

pub async fn dismiss(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> CoreResult<Json<Value>> {
    ctx.service.dismiss(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn undismiss(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> CoreResult<Json<Value>> {
    ctx.service.undismiss(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn kill(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> CoreResult<Json<Value>> {
    ctx.service.kill(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn mark_exited(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> CoreResult<Json<Value>> {
    ctx.service.mark_exited(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn history(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> CoreResult<Json<Value>> {
    let items = ctx.service.history(&id).await?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct SendBody {
    text: String,
    #[serde(default)]
    runtime_options: Option<RuntimeOptions>,
}

pub async fn send(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>, Json(body): Json<SendBody>) -> CoreResult<Json<Value>> {
    let turn_id = match body.runtime_options {
        Some(opts) => ctx.service.send_message_with_options(&id, &body.text, opts).await?,
        None => ctx.service.send_message(&id, &body.text).await?,
    };
    Ok(Json(json!({ "turnId": turn_id })))
}

pub async fn interrupt(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> CoreResult<Json<Value>> {
    ctx.service.interrupt_turn(&id).await?;
    Ok(Json(json!({ "ok": true })))
}
