//! Presence heartbeat route.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::ActivityRecord;

use crate::middleware::auth::{AuthUser, Role};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/activity/heartbeat", post(heartbeat))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub context_id: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// POST /api/activity/heartbeat: Mark the caller present (or not) in a conversation.
async fn heartbeat(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<ActivityRecord>, AppError> {
    auth.require(&[Role::User])?;
    let record = state
        .activity()
        .heartbeat(auth.user_id, &req.context_id, req.active, Utc::now())
        .await?;
    Ok(Json(record))
}
