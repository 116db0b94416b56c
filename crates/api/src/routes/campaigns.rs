//! Campaign routes.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_common::types::Campaign;
use herald_engine::campaigns::CreateCampaignParams;

use crate::middleware::auth::{AuthUser, Role};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/campaigns", post(create_campaign))
}

/// POST /api/campaigns: Create a draft, or a scheduled campaign when a schedule is given.
async fn create_campaign(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<CreateCampaignParams>,
) -> Result<Json<Campaign>, AppError> {
    auth.require(&[Role::Admin])?;
    let campaign = state.campaigns().create(&params).await?;
    Ok(Json(campaign))
}
