pub mod activity;
pub mod campaigns;
pub mod events;
pub mod health;
pub mod notifications;
pub mod tokens;
pub mod triggers;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(tokens::router())
        .merge(activity::router())
        .merge(notifications::router())
        .merge(events::router())
        .merge(campaigns::router())
        .merge(triggers::router())
        .with_state(state)
}
