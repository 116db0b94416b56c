//! Trigger entry points for cron callers.
//!
//! Parameters travel in the query string so an empty POST runs the default.

use axum::extract::{Query, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use herald_common::error::AppError;
use herald_engine::campaigns::CampaignRunSummary;
use herald_engine::rules::{EvaluateOptions, RuleRunSummary};
use herald_engine::worker::QueueRunSummary;

use crate::middleware::auth::{AuthUser, Role};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/triggers/process-campaigns", post(process_campaigns))
        .route("/api/triggers/process-rules", post(process_rules))
        .route("/api/triggers/process-queue", post(process_queue))
}

#[derive(Debug, Deserialize)]
pub struct ProcessRulesQuery {
    pub rule_type: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub test_mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProcessQueueQuery {
    pub limit: Option<i64>,
}

async fn process_campaigns(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<CampaignRunSummary>, AppError> {
    auth.require(&[Role::Admin, Role::Service])?;
    let summary = state.campaign_scheduler().run(Utc::now()).await?;
    Ok(Json(summary))
}

async fn process_rules(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ProcessRulesQuery>,
) -> Result<Json<RuleRunSummary>, AppError> {
    auth.require(&[Role::Admin, Role::Service])?;
    let options = EvaluateOptions {
        force: query.force,
        test_mode: query.test_mode,
    };
    let summary = state
        .rule_engine()
        .process(query.rule_type.as_deref(), Utc::now(), options)
        .await?;
    Ok(Json(summary))
}

async fn process_queue(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ProcessQueueQuery>,
) -> Result<Json<QueueRunSummary>, AppError> {
    auth.require(&[Role::Admin, Role::Service])?;
    if let Some(limit) = query.limit {
        if !(1..=1000).contains(&limit) {
            return Err(AppError::Validation(
                "limit must be between 1 and 1000".to_string(),
            ));
        }
    }
    let summary = state.queue_processor().run_once(Utc::now(), query.limit).await?;
    Ok(Json(summary))
}
