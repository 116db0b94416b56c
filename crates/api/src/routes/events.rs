//! Domain events pushed by the chat transport.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_engine::chat::ChatMessageEvent;
use herald_engine::dispatcher::DispatchSummary;

use crate::middleware::auth::{AuthUser, Role};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/events/chat-message", post(chat_message))
}

/// POST /api/events/chat-message: Notify the other participants of a new message.
async fn chat_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(event): Json<ChatMessageEvent>,
) -> Result<Json<DispatchSummary>, AppError> {
    auth.require(&[Role::Service])?;
    let summary = state.direct().send_chat_message(&event).await?;
    Ok(Json(summary))
}
