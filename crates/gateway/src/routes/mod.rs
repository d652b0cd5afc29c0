pub mod health;
pub mod notifications;

use axum::Router;

use crate::state::AppState;

/// Build the complete gateway router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(notifications::router())
        .with_state(state)
}
