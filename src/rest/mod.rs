//! REST API server exposing the wire interfaces of spec §6 over the
//! `SessionService` façade.
//!
//! Grounded on the teacher's axum router shape (state-carrying `Router`,
//! `:id` path params, a dedicated `sse` module for streamed responses).

pub mod routes;
pub mod sse;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/v1/health", get(routes::health::health))
        .route(
            "/api/v1/sessions",
            get(routes::sessions::list).post(routes::sessions::start),
        )
        .route(
            "/api/v1/sessions/{id}",
            get(routes::sessions::get_one).patch(routes::sessions::update),
        )
        .route("/api/v1/sessions/{id}/dismiss", post(routes::sessions::dismiss))
        .route("/api/v1/sessions/{id}/undismiss", post(routes::sessions::undismiss))
        .route("/api/v1/sessions/{id}/kill", post(routes::sessions::kill))
        .route("/api/v1/sessions/{id}/mark-exited", post(routes::sessions::mark_exited))
        .route("/api/v1/sessions/{id}/history", get(routes::sessions::history))
        .route("/api/v1/sessions/{id}/send", post(routes::sessions::send))
        .route("/api/v1/sessions/{id}/interrupt", post(routes::sessions::interrupt))
        .route("/api/v1/sessions/{id}/approvals", get(routes::approvals::list))
        .route("/api/v1/sessions/{id}/approval", post(routes::approvals::decide))
        .route("/api/v1/sessions/{id}/tail", get(sse::tail))
        .route("/api/v1/sessions/{id}/items", get(sse::items))
        .route("/api/v1/sessions/{id}/events", get(sse::events))
        .with_state(ctx)
}
