//! # ODF Sync Engine
//!
//! The core of collaborative operation synchronization for shared documents.
//!
//! Members of a session edit their local copy of a document and exchange
//! the edits as operations. A server keeps one canonical, totally ordered
//! log per session; members reconcile their unacknowledged edits with
//! edits other members got accepted first, by operational transformation.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows no network, files or timers. Deadlines are
//!   computed from the `now` the caller passes in; only a playback slice
//!   reads the monotonic clock, to bound its own duration
//! - **Deterministic**: transformation is a pure function of its inputs
//! - **Generic over operations**: the engine moves opaque [`OperationSpec`]s;
//!   concrete operations plug in through [`OperationFactory`], [`Playback`]
//!   and a [`TransformMatrix`]
//!
//! ## Core Concepts
//!
//! ### Session log
//!
//! [`SessionLog`] is the server-side authority for one document: an
//! append-only operation log, the join point of each member and a sequence
//! counter. Appending requires presenting the current [`SeqToken`]; a
//! member receives what was appended after the token it presents.
//!
//! ### Operation router
//!
//! [`OperationRouter`] is the client-side state machine: it applies local
//! operations immediately, uploads them in debounced batches, transforms
//! them on conflict and plays remote operations back in bounded time
//! slices. It is sans-IO; a driver feeds it time and replies.
//!
//! ### Transformation
//!
//! [`OperationTransformer`] rewrites two divergent operation sequences so
//! that both application orders converge. Pairwise rules live in a
//! [`TransformMatrix`]; the [`textops`] module ships a complete set for
//! plain text.
//!
//! ## Quick Start
//!
//! ```rust
//! use odfsync_engine::textops::{self, TextDocument, TextOperation, TextOperationFactory};
//! use odfsync_engine::{OperationRouter, RouterConfig, SessionLog};
//! use std::time::Instant;
//!
//! // Server side: one log per session
//! let mut log = SessionLog::new("Session #1");
//! log.add_member("alice", 1706745600000);
//!
//! // Client side: one router per member
//! let now = Instant::now();
//! let mut router = OperationRouter::new(
//!     "doc",
//!     "alice",
//!     TextOperationFactory,
//!     TextDocument::default(),
//!     textops::transformer(),
//!     RouterConfig::default(),
//!     now,
//! );
//!
//! // Local edits apply immediately
//! router
//!     .push(vec![TextOperation::insert_text("alice", 0, "hello")], 1706745600000, now)
//!     .unwrap();
//! assert_eq!(router.playback().text(), "hello");
//!
//! // Sync: hand the request to the server, feed the reply back
//! router.request_instant_sync();
//! while let Some(request) = router.poll_transmit() {
//!     let reply = log
//!         .sync_ops(&request.member_id, &request.seq_head, request.client_ops)
//!         .unwrap();
//!     router.handle_sync_response(reply, now);
//! }
//!
//! assert!(!router.has_local_unsynced_ops());
//! assert_eq!(log.len(), 2);
//! ```

pub mod error;
pub mod operation;
pub mod protocol;
pub mod router;
pub mod session;
pub mod textops;
pub mod transform;

// Re-export main types at crate root
pub use error::{Error, PlaybackError, Result, RouterError, SessionError, TransformError};
pub use operation::{Operation, OperationFactory, OperationSpec, Playback};
pub use protocol::{
    JoinSessionRequest, JoinSessionResponse, LeaveSessionRequest, SessionInfo, SessionStateQuery,
    SyncOpsRequest, SyncOpsResponse, SyncResult,
};
pub use router::{
    OperationRouter, RouterConfig, RouterEvent, RouterState, SyncFailure,
};
pub use session::{RemoteChanges, SeqToken, SessionLog};
pub use transform::{
    pass_unchanged, OperationTransformer, PairTransform, TransformMatrix, TransformResult,
    TransformRule,
};

/// Type aliases for clarity
pub type SessionId = String;
pub type MemberId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn timestamp_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as Timestamp)
        .unwrap_or_default()
}
