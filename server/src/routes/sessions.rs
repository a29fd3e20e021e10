//! Session RPC routes.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use odfsync_engine::{
    JoinSessionRequest, JoinSessionResponse, LeaveSessionRequest, MemberId, SessionInfo,
    SessionStateQuery, SyncOpsRequest, SyncOpsResponse,
};

use crate::error::{AppError, Result};
use crate::AppState;

/// Create session routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}/join", post(join_session))
        .route("/sessions/{session_id}/leave", post(leave_session))
        .route("/sessions/{session_id}/members", get(member_ids))
        .route("/sessions/{session_id}/sync_ops", post(sync_ops))
        .route("/sessions/{session_id}/state", put(write_state))
}

/// GET /sessions - List active sessions.
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.sessions().await)
}

/// POST /sessions/{id}/join - Add a member, creating the session if needed.
async fn join_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<JoinSessionRequest>,
) -> Result<Json<JoinSessionResponse>> {
    let member_id = state
        .sessions
        .join_session(&session_id, &request.user_id)
        .await?;
    Ok(Json(JoinSessionResponse { member_id }))
}

/// POST /sessions/{id}/leave
async fn leave_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<LeaveSessionRequest>,
) -> Result<StatusCode> {
    state
        .sessions
        .leave_session(&session_id, &request.member_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /sessions/{id}/members
async fn member_ids(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<MemberId>>> {
    Ok(Json(state.sessions.get_member_ids(&session_id).await?))
}

/// POST /sessions/{id}/sync_ops - One synchronization round.
async fn sync_ops(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<SyncOpsRequest>,
) -> Result<Json<SyncOpsResponse>> {
    if request.es_id != session_id {
        return Err(AppError::BadRequest(format!(
            "request for session {} sent to session {session_id}",
            request.es_id
        )));
    }

    let response = state.sessions.sync_ops(request).await?;
    Ok(Json(response))
}

/// PUT /sessions/{id}/state?member_id=..&seq=.. - Store a document snapshot.
async fn write_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SessionStateQuery>,
    document: Bytes,
) -> Result<StatusCode> {
    state
        .sessions
        .write_session_state_to_file(&session_id, &query.member_id, &query.seq, &document)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
