//! Error types for the session client.

use std::time::Duration;

use odfsync_engine::{RouterError, SyncFailure};
use thiserror::Error;

/// A session RPC that did not produce a usable reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("session host unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("session host answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("undecodable reply: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the call may succeed when retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Unreachable(_) | TransportError::Timeout(_) => true,
            TransportError::Status { status, .. } => *status >= 500,
            TransportError::Decode(_) => false,
        }
    }

    /// How a failed `sync_ops` call is reported to the router.
    pub fn into_sync_failure(self) -> SyncFailure {
        if self.is_transient() {
            SyncFailure::Unreachable(self.to_string())
        } else {
            SyncFailure::Malformed(self.to_string())
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else if err.is_timeout() {
            TransportError::Unreachable(format!("timeout: {err}"))
        } else {
            TransportError::Unreachable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Router(#[from] RouterError),

    /// The driver task is gone, usually because the router stopped.
    #[error("session driver stopped")]
    DriverStopped,

    /// A sync request was dropped because the router stopped or closed.
    #[error("sync cancelled")]
    SyncCancelled,

    /// Closing did not finish in time; local operations may not be uploaded.
    #[error("close timed out after {0:?}")]
    CloseTimedOut(Duration),
}

pub type Result<T> = std::result::Result<T, ClientError>;
