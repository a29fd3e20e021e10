//! Session registry.
//!
//! Sessions are created on the first join and live as long as the process.
//! The registry itself is a concurrent map; all work on one session goes
//! through that session's lock, so compare-and-append on its log is atomic
//! while different sessions proceed in parallel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use odfsync_engine::protocol::{ENOMEMBER, ENOSESSION};
use odfsync_engine::{
    MemberId, OperationSpec, RemoteChanges, SeqToken, SessionError, SessionId, SessionInfo,
    SessionLog, SyncOpsRequest, SyncOpsResponse, Timestamp,
};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{AppError, Result};

/// A session log shared between request handlers.
pub type SharedLog = Arc<Mutex<SessionLog>>;

/// All sessions hosted by this server.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<SessionId, SharedLog>,
    /// Prefix of generated session titles.
    title_prefix: String,
    /// Directory receiving uploaded document snapshots.
    state_dir: PathBuf,
    /// Number of sessions created so far.
    created: AtomicU64,
    /// Maintenance mode.
    paused: AtomicBool,
}

impl SessionManager {
    pub fn new(title_prefix: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions: DashMap::new(),
            title_prefix: title_prefix.into(),
            state_dir: state_dir.into(),
            created: AtomicU64::new(0),
            paused: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.session_title_prefix.clone(), config.state_dir.clone())
    }

    /// Create a new session manager wrapped in Arc for sharing.
    pub fn new_shared(title_prefix: impl Into<String>, state_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self::new(title_prefix, state_dir))
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Fail every session RPC with `SERVICE_UNAVAILABLE` until [`resume`](Self::resume).
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("session service paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("session service resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> std::result::Result<(), SessionError> {
        if self.is_paused() {
            return Err(SessionError::ServiceUnavailable);
        }
        Ok(())
    }

    fn session(&self, session_id: &str) -> std::result::Result<SharedLog, SessionError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add a new member for `user_id`, creating the session if needed.
    ///
    /// Every join yields a fresh member id, so one user can take part in a
    /// session several times.
    pub async fn join_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> std::result::Result<MemberId, SessionError> {
        self.ensure_available()?;

        let log = Arc::clone(
            self.sessions
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    let number = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                    let title = format!("{} #{number}", self.title_prefix);
                    tracing::info!(session_id, title = %title, "session created");
                    Arc::new(Mutex::new(SessionLog::new(title)))
                })
                .value(),
        );

        let member_id = new_member_id(user_id);
        let seq = log.lock().await.add_member(&member_id, now_millis());
        tracing::info!(session_id, member_id = %member_id, seq = %seq, "member joined");

        Ok(member_id)
    }

    /// Remove a member from a session.
    pub async fn leave_session(
        &self,
        session_id: &str,
        member_id: &str,
    ) -> std::result::Result<(), SessionError> {
        self.ensure_available()?;

        let log = self.session(session_id)?;
        let seq = log.lock().await.remove_member(member_id, now_millis())?;
        tracing::info!(session_id, member_id, seq = %seq, "member left");

        Ok(())
    }

    pub async fn get_member_ids(
        &self,
        session_id: &str,
    ) -> std::result::Result<Vec<MemberId>, SessionError> {
        self.ensure_available()?;

        let log = self.session(session_id)?;
        let members = log.lock().await.member_ids();
        Ok(members)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Serve one synchronization round.
    ///
    /// Unknown sessions and members are answered with an error reply
    /// rather than an error, so the client router can tell them apart from
    /// an unreachable server.
    pub async fn sync_ops(
        &self,
        request: SyncOpsRequest,
    ) -> std::result::Result<SyncOpsResponse, SessionError> {
        self.ensure_available()?;

        let log = match self.session(&request.es_id) {
            Ok(log) => log,
            Err(_) => {
                tracing::warn!(session_id = %request.es_id, "sync_ops for unknown session");
                return Ok(SyncOpsResponse::error(ENOSESSION));
            }
        };

        let mut log = log.lock().await;
        match log.sync_ops(&request.member_id, &request.seq_head, request.client_ops) {
            Ok(reply) => {
                tracing::debug!(
                    session_id = %request.es_id,
                    member_id = %request.member_id,
                    result = ?reply.result,
                    head_seq = %reply.head_seq,
                    ops = reply.ops.len(),
                    "sync_ops served"
                );
                Ok(reply)
            }
            Err(SessionError::MemberNotInSession(member_id)) => {
                tracing::warn!(session_id = %request.es_id, member_id = %member_id, "sync_ops for unknown member");
                Ok(SyncOpsResponse::error(ENOMEMBER))
            }
            Err(err) => Err(err),
        }
    }

    /// Append operations if `expected` is the current sequence token.
    pub async fn push(
        &self,
        session_id: &str,
        member_id: &str,
        expected: &SeqToken,
        specs: Vec<OperationSpec>,
    ) -> std::result::Result<SeqToken, SessionError> {
        self.ensure_available()?;

        let log = self.session(session_id)?;
        let mut log = log.lock().await;
        log.push(member_id, expected, specs)
    }

    pub async fn get_remote_changes(
        &self,
        session_id: &str,
        member_id: &str,
    ) -> std::result::Result<RemoteChanges, SessionError> {
        self.ensure_available()?;

        let log = self.session(session_id)?;
        let mut log = log.lock().await;
        log.get_remote_changes(member_id)
    }

    /// All sessions, ordered by id.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let entries: Vec<(SessionId, SharedLog)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut infos = Vec::with_capacity(entries.len());
        for (id, log) in entries {
            let log = log.lock().await;
            infos.push(SessionInfo {
                id,
                title: log.title().to_string(),
                members: log.member_ids(),
            });
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Store a member's snapshot of the document at log state `seq`.
    ///
    /// The file goes to `<state_dir>/<session>/<seq>.odt`.
    pub async fn write_session_state_to_file(
        &self,
        session_id: &str,
        member_id: &str,
        seq: &SeqToken,
        document: &[u8],
    ) -> Result<PathBuf> {
        self.ensure_available()?;

        if !is_file_name_safe(session_id) || !is_file_name_safe(seq.as_str()) {
            return Err(AppError::BadRequest(format!(
                "cannot store state of session {session_id} at {seq}"
            )));
        }

        let log = self.session(session_id)?;
        if !log.lock().await.has_member(member_id) {
            return Err(SessionError::MemberNotInSession(member_id.to_string()).into());
        }

        let dir = self.state_dir.join(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{seq}.odt"));
        tokio::fs::write(&path, document).await?;

        tracing::info!(
            session_id,
            member_id,
            seq = %seq,
            bytes = document.len(),
            path = %path.display(),
            "session state written"
        );
        Ok(path)
    }
}

/// Member id derived from the user id plus a random suffix.
fn new_member_id(user_id: &str) -> MemberId {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{user_id}_{}", &suffix[..8])
}

fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

fn is_file_name_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
