//! Liveness plus dependency reachability.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use herald_common::{db, redis_pool};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// 200 when PostgreSQL and Redis both answer, 503 otherwise.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let (database, redis) = tokio::join!(
        db::is_reachable(&state.pool),
        redis_pool::is_reachable(&state.redis)
    );
    let healthy = database && redis;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "herald-api",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if database { "up" } else { "down" },
            "redis": if redis { "up" } else { "down" },
        })),
    )
}
