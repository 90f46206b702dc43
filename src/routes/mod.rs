//! HTTP route handlers

pub mod health;
pub mod sync;

use axum::Router;

use crate::state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/api/v1/health", health::router())
        .nest("/api/v1/sync", sync::router())
        .with_state(state)
}
