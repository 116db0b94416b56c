//! Device token routes.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{AddressKind, Platform};
use herald_engine::tokens::RegisterTokenParams;

use crate::middleware::auth::{AuthUser, Role};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tokens", post(register_token).delete(deactivate_token))
        .route("/api/tokens/purge", post(purge_tokens))
}

#[derive(Debug, Deserialize)]
pub struct RegisterTokenRequest {
    /// Only admins and services may register for another user.
    pub user_id: Option<Uuid>,
    pub platform: Platform,
    pub address_kind: AddressKind,
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterTokenResponse {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub platform: Platform,
    pub address_kind: AddressKind,
}

#[derive(Debug, Deserialize)]
pub struct DeactivateTokenRequest {
    pub user_id: Uuid,
    pub platform: Platform,
    pub address_kind: AddressKind,
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    #[serde(default = "default_purge_days")]
    pub older_than_days: u32,
}

fn default_purge_days() -> u32 {
    30
}

/// Longest purge horizon accepted, about ten years.
const MAX_PURGE_DAYS: u32 = 3650;

impl PurgeRequest {
    fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        if !(1..=MAX_PURGE_DAYS).contains(&self.older_than_days) {
            return Err(AppError::Validation(format!(
                "older_than_days must be between 1 and {}",
                MAX_PURGE_DAYS
            )));
        }
        now.checked_sub_signed(Duration::days(i64::from(self.older_than_days)))
            .ok_or_else(|| AppError::Validation("older_than_days is out of range".to_string()))
    }
}

/// POST /api/tokens: Register or refresh a device address.
async fn register_token(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<RegisterTokenRequest>,
) -> Result<Json<RegisterTokenResponse>, AppError> {
    let user_id = match req.user_id {
        Some(id) if id != auth.user_id => {
            if !auth.is_privileged() {
                return Err(AppError::Forbidden(
                    "cannot register a token for another user".to_string(),
                ));
            }
            id
        }
        Some(id) => id,
        None if auth.role == Role::User => auth.user_id,
        None => {
            return Err(AppError::Validation(
                "user_id is required for service and admin callers".to_string(),
            ));
        }
    };

    let token = state
        .tokens()
        .register(&RegisterTokenParams {
            user_id,
            platform: req.platform,
            address_kind: req.address_kind,
            address: req.address,
        })
        .await?;

    Ok(Json(RegisterTokenResponse {
        token_id: token.id,
        user_id: token.user_id,
        platform: token.platform,
        address_kind: token.address_kind,
    }))
}

/// DELETE /api/tokens: Deactivate a device address (admin).
async fn deactivate_token(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<DeactivateTokenRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    auth.require(&[Role::Admin])?;
    let deactivated = state
        .tokens()
        .deactivate(req.user_id, req.platform, req.address_kind)
        .await?;
    if !deactivated {
        return Err(AppError::NotFound(format!(
            "No active {} token on {} for user {}",
            req.address_kind, req.platform, req.user_id
        )));
    }
    Ok(Json(serde_json::json!({ "deactivated": true })))
}

/// POST /api/tokens/purge: Delete inactive tokens older than N days (admin).
async fn purge_tokens(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PurgeRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    auth.require(&[Role::Admin])?;
    let cutoff = req.cutoff(Utc::now())?;
    let purged = state.tokens().purge_inactive(cutoff).await?;
    Ok(Json(serde_json::json!({ "purged": purged })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_cutoff_defaults_to_thirty_days() {
        let req: PurgeRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        let now = Utc::now();
        assert_eq!(req.cutoff(now).unwrap(), now - Duration::days(30));
    }

    #[test]
    fn test_purge_horizon_out_of_range_rejected() {
        let now = Utc::now();
        for days in [0, MAX_PURGE_DAYS + 1, u32::MAX] {
            let req = PurgeRequest {
                older_than_days: days,
            };
            assert!(matches!(req.cutoff(now), Err(AppError::Validation(_))));
        }
        let longest = PurgeRequest {
            older_than_days: MAX_PURGE_DAYS,
        };
        assert!(longest.cutoff(now).is_ok());
    }
}
