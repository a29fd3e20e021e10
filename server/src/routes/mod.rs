//! HTTP route definitions.

mod admin;
mod health;
mod sessions;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sessions::routes())
        .merge(admin::routes())
}
