//! Maintenance endpoints.

use axum::{extract::State, http::StatusCode, routing::post, Router};

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/pause", post(pause))
        .route("/admin/resume", post(resume))
}

/// POST /admin/pause - Reject session RPCs until resumed.
async fn pause(State(state): State<AppState>) -> StatusCode {
    state.sessions.pause();
    StatusCode::NO_CONTENT
}

/// POST /admin/resume
async fn resume(State(state): State<AppState>) -> StatusCode {
    state.sessions.resume();
    StatusCode::NO_CONTENT
}
