//! Per-session streamed reads (spec §6): `tail` (one-shot or SSE-follow),
//! `items` (SSE with a disk-backed snapshot prefix), `events` (SSE closing
//! after `turn/completed`).
//!
//! Grounded on the teacher's `stream::unfold` SSE bridge shape; the keep-
//! alive framing (15s interval, initial comment-line flush) is spelled out
//! literally rather than left to `axum::sse`'s defaults, per spec §6.

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::model::LogStream;
use crate::AppContext;

fn keep_alive() -> KeepAlive {
    KeepAlive::new().interval(Duration::from_secs(15)).text(":")
}

#[derive(Deserialize)]
pub struct TailQuery {
    #[serde(default)]
    follow: bool,
}

pub async fn tail(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(q): Query<TailQuery>,
) -> CoreResult<axum::response::Response> {
    if !q.follow {
        let dir = ctx.manager.session_dir(&id);
        let stdout = tokio::fs::read_to_string(dir.join("stdout.log")).await.unwrap_or_default();
        let stderr = tokio::fs::read_to_string(dir.join("stderr.log")).await.unwrap_or_default();
        return Ok(Json(json!({ "stdout": stdout, "stderr": stderr })).into_response());
    }

    let (mut rx, cancel) = ctx.service.subscribe(&id, LogStream::Combined).await?;
    let s = stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
        let event = rx.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_default();
        Some((Ok::<Event, Infallible>(Event::default().data(data)), (rx, cancel)))
    });
    Ok(Sse::new(s).keep_alive(keep_alive()).into_response())
}

pub async fn items(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> CoreResult<impl IntoResponse> {
    let (snapshot, rx, cancel) = ctx.service.subscribe_items(&id).await?;
    let prefix = stream::iter(snapshot.into_iter().map(|item| {
        let data = serde_json::to_string(&item).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().data(data))
    }));
    let live = stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
        let item = rx.recv().await?;
        let data = serde_json::to_string(&item).unwrap_or_default();
        Some((Ok::<Event, Infallible>(Event::default().data(data)), (rx, cancel)))
    });
    Ok(Sse::new(prefix.chain(live)).keep_alive(keep_alive()))
}

fn is_turn_completed(item: &Value) -> bool {
    item.get("type").and_then(Value::as_str) == Some("turn/completed")
}

pub async fn events(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> CoreResult<impl IntoResponse> {
    let rx = ctx.service.subscribe_events(&id).await.map_err(CoreError::from)?;
    let s = stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        let item = rx.recv().await?;
        let data = serde_json::to_string(&item).unwrap_or_default();
        let event = Event::default().data(data);
        let done = is_turn_completed(&Value::Object(item));
        Some((Ok::<Event, Infallible>(event), if done { None } else { Some(rx) }))
    });

    let leading = stream::once(async { Ok::<Event, Infallible>(Event::default().comment("")) });
    Ok(Sse::new(leading.chain(s)).keep_alive(keep_alive()))
}

pub type BoxedEventStream = std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;
