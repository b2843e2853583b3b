//! Approval listing & decision routes (spec §4.7, §6).

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::adapters::ApprovalDecision;
use crate::error::CoreResult;
use crate::AppContext;

#[derive(Deserialize)]
pub struct ApprovalsQuery {
    #[serde(default)]
    resync: bool,
}

pub async fn list(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(q): Query<ApprovalsQuery>,
) -> CoreResult<Json<Value>> {
    let approvals = ctx.service.list_approvals(&id, q.resync).await?;
    Ok(Json(json!({ "approvals": approvals })))
}

#[derive(Deserialize)]
pub struct ApprovalBody {
    request_id: u64,
    decision: String,
    #[serde(default)]
    responses: Option<Value>,
    #[serde(default)]
    accept_settings: Option<Value>,
}

pub async fn decide(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<ApprovalBody>,
) -> CoreResult<Json<Value>> {
    ctx.service
        .approve(
            &id,
            body.request_id,
            ApprovalDecision {
                decision: body.decision,
                responses: body.responses,
                accept_settings: body.accept_settings,
            },
        )
        .await?;
    Ok(Json(json!({ "ok": true })))
}
