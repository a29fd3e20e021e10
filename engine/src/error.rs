//! Error types for the sync engine.

use crate::{MemberId, SeqToken, SessionId};
use thiserror::Error;

/// Errors reported by a session log or the server holding it.
///
/// Each variant carries a stable [`code`](SessionError::code) that is
/// surfaced over the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("member with id {0} is not part of session")]
    MemberNotInSession(MemberId),

    #[error("state sequence out of date: expected {expected}, got {presented}")]
    SeqOutOfDate {
        expected: SeqToken,
        presented: SeqToken,
    },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("service is unavailable")]
    ServiceUnavailable,
}

impl SessionError {
    /// Stable error code, as reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::MemberNotInSession(_) => "MEMBER_NOT_IN_SESSION",
            SessionError::SeqOutOfDate { .. } => "SEQ_OUTOFDATE",
            SessionError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SessionError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

/// No transformation rule exists for a pair of operation types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no transformation between {optype_a} and {optype_b}")]
pub struct TransformError {
    pub optype_a: String,
    pub optype_b: String,
}

/// An operation could not be applied to the document.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot apply {optype}: {reason}")]
pub struct PlaybackError {
    pub optype: String,
    pub reason: String,
}

impl PlaybackError {
    pub fn new(optype: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            optype: optype.into(),
            reason: reason.into(),
        }
    }
}

/// Fatal conditions of an operation router.
///
/// Once one of these is reported the router accepts no further work and
/// the session has to be re-established from scratch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("unresolvable conflicting operations")]
    UnresolvableConflict,

    #[error("operation execution failure: {0}")]
    OpExecutionFailure(String),

    #[error("session does not exist")]
    SessionDoesNotExist,

    #[error("not member of session")]
    NotMemberOfSession,

    #[error("unknown server reply: {0}")]
    UnknownServerReply(String),

    #[error("router is closed")]
    Closed,
}

/// All errors of the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
