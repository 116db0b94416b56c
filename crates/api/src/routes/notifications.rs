//! On-demand notification routes.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::NotificationEntry;
use herald_engine::direct::SendNowRequest;
use herald_engine::dispatcher::DispatchSummary;
use herald_engine::queue::NewEntry;

use crate::middleware::auth::{AuthUser, Role};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications/send", post(send_now))
        .route("/api/notifications/enqueue", post(enqueue))
        .route("/api/notifications/{id}/cancel", post(cancel))
}

/// POST /api/notifications/send: Dispatch immediately and return the aggregate.
async fn send_now(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<SendNowRequest>,
) -> Result<Json<DispatchSummary>, AppError> {
    auth.require(&[Role::Admin, Role::Service])?;
    let summary = state.direct().send_now(&req).await?;
    Ok(Json(summary))
}

/// POST /api/notifications/enqueue: Add an entry to the durable queue.
async fn enqueue(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(entry): Json<NewEntry>,
) -> Result<Json<NotificationEntry>, AppError> {
    auth.require(&[Role::Admin, Role::Service])?;
    let entry = state.queue().enqueue(&entry).await?;
    Ok(Json(entry))
}

/// POST /api/notifications/:id/cancel: Cancel a queued entry (admin).
async fn cancel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationEntry>, AppError> {
    auth.require(&[Role::Admin])?;
    let entry = state.queue().cancel(id).await?;
    Ok(Json(entry))
}
