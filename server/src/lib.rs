//! ODF Sync Server - hosts collaborative editing sessions.
//!
//! Every session keeps one canonical operation log. Members join over
//! HTTP, exchange operations through `sync_ops` rounds and upload
//! snapshots of their document when they leave.

pub mod config;
pub mod error;
pub mod routes;
pub mod session;

pub use crate::config::{Config, ConfigError};
pub use crate::error::{AppError, Result};
pub use crate::session::SessionManager;

use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            sessions: Arc::new(SessionManager::from_config(&config)),
            config: Arc::new(config),
        }
    }
}

/// Build the HTTP application.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}
