//! API route modules.

pub mod downloads;
pub mod health;
pub mod logging;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/downloads", downloads::router())
        .nest("/api/logging", logging::router())
        .nest("/api/health", health::router())
        .with_state(state)
}
