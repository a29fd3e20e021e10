//! Wire types for the session RPCs.
//!
//! Field names follow the session server's JSON conventions
//! (`es_id`, `seq_head`, `client_ops`, ...).

use crate::{MemberId, OperationSpec, SeqToken, SessionId};
use serde::{Deserialize, Serialize};

/// Error reply for a session that does not exist.
pub const ENOSESSION: &str = "ENOSESSION";
/// Error reply for a member that is not part of the session.
pub const ENOMEMBER: &str = "ENOMEMBER";

/// One synchronization round: upload local operations, download remote ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOpsRequest {
    pub es_id: SessionId,
    pub member_id: MemberId,
    /// Last sequence token the client observed.
    pub seq_head: SeqToken,
    /// Local operations not yet acknowledged; empty for a pure poll.
    #[serde(default)]
    pub client_ops: Vec<OperationSpec>,
}

/// Outcome of a [`SyncOpsRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResult {
    /// The client operations were appended to the log.
    Added,
    /// Nothing was uploaded; `ops` holds what the member has not seen yet.
    NewOps,
    /// The presented token was stale; nothing was appended.
    Conflict,
    /// The request could not be served, see `error`.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOpsResponse {
    pub result: SyncResult,
    #[serde(default)]
    pub head_seq: SeqToken,
    #[serde(default)]
    pub ops: Vec<OperationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOpsResponse {
    pub fn added(head_seq: SeqToken) -> Self {
        Self {
            result: SyncResult::Added,
            head_seq,
            ops: Vec::new(),
            error: None,
        }
    }

    pub fn new_ops(head_seq: SeqToken, ops: Vec<OperationSpec>) -> Self {
        Self {
            result: SyncResult::NewOps,
            head_seq,
            ops,
            error: None,
        }
    }

    pub fn conflict(head_seq: SeqToken, ops: Vec<OperationSpec>) -> Self {
        Self {
            result: SyncResult::Conflict,
            head_seq,
            ops,
            error: None,
        }
    }

    pub fn error(code: impl Into<String>) -> Self {
        Self {
            result: SyncResult::Error,
            head_seq: SeqToken::default(),
            ops: Vec::new(),
            error: Some(code.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSessionRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSessionResponse {
    pub member_id: MemberId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveSessionRequest {
    pub member_id: MemberId,
}

/// Query parameters accompanying an uploaded session snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStateQuery {
    pub member_id: MemberId,
    pub seq: SeqToken,
}

/// Listing entry for an active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub title: String,
    pub members: Vec<MemberId>,
}
