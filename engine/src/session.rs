//! Canonical operation log of one collaborative session.
//!
//! The log is append-only and totally ordered. Every append advances a
//! sequence counter, and a member may only append while presenting the
//! token of the current counter. That compare-and-append is the single
//! linearization point of the whole system, so callers sharing a
//! [`SessionLog`] between threads must hold one lock around each call.
//!
//! [`SessionLog::sync_ops`] answers from the token the member presents,
//! not from what it was sent before: a member whose reply got lost asks
//! again with the same token and receives the same operations.

use crate::textops::{member_color, ADD_MEMBER, REMOVE_MEMBER};
use crate::{MemberId, OperationSpec, SessionError, SyncOpsResponse, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace};

/// Opaque marker of a log state.
///
/// Clients compare tokens for equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqToken(String);

impl SeqToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token for a given sequence counter value.
    pub fn from_counter(counter: u64) -> Self {
        Self(format!("jsg{counter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The counter of a token built by [`SeqToken::from_counter`].
    pub fn counter(&self) -> Option<u64> {
        self.0.strip_prefix("jsg")?.parse().ok()
    }
}

impl fmt::Display for SeqToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations a member has not received yet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteChanges {
    pub specs: Vec<OperationSpec>,
    /// Token of the log state the specs lead up to.
    pub sequence_id: SeqToken,
}

/// Operations added by one append, `operations[start..end]`.
#[derive(Debug, Clone)]
struct Append {
    start: usize,
    end: usize,
    /// `None` for member records, which everybody receives.
    pusher: Option<MemberId>,
}

#[derive(Debug, Clone, Copy)]
struct MemberState {
    joined_at: usize,
    cursor: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    title: String,
    operations: Vec<OperationSpec>,
    /// Append `n` moved the counter from `n` to `n + 1`.
    appends: Vec<Append>,
    members: BTreeMap<MemberId, MemberState>,
}

impl SessionLog {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn operations(&self) -> &[OperationSpec] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn sequence_token(&self) -> SeqToken {
        SeqToken::from_counter(self.appends.len() as u64)
    }

    /// Tracked members, sorted.
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.members.keys().cloned().collect()
    }

    pub fn has_member(&self, member_id: &str) -> bool {
        self.members.contains_key(member_id)
    }

    fn append(
        &mut self,
        pusher: Option<&str>,
        specs: impl IntoIterator<Item = OperationSpec>,
    ) -> SeqToken {
        let start = self.operations.len();
        self.operations.extend(specs);
        self.appends.push(Append {
            start,
            end: self.operations.len(),
            pusher: pusher.map(str::to_string),
        });
        self.sequence_token()
    }

    /// Start tracking a member.
    ///
    /// The member only receives operations from its own join onwards; the
    /// join itself is logged so that everyone sees it. Adding a tracked
    /// member again changes nothing.
    pub fn add_member(&mut self, member_id: &str, timestamp: Timestamp) -> SeqToken {
        if self.has_member(member_id) {
            return self.sequence_token();
        }

        let joined_at = self.operations.len();
        self.members.insert(
            member_id.to_string(),
            MemberState {
                joined_at,
                cursor: joined_at,
            },
        );

        let mut spec = OperationSpec::new(ADD_MEMBER, member_id).with(
            "setProperties",
            json!({
                "fullName": member_id,
                "color": member_color(member_id),
                "imageUrl": "",
            }),
        );
        spec.set_timestamp(timestamp);
        let seq = self.append(None, [spec]);
        debug!(title = %self.title, member_id, seq = %seq, "member added");
        seq
    }

    /// Stop tracking a member and log its departure.
    pub fn remove_member(
        &mut self,
        member_id: &str,
        timestamp: Timestamp,
    ) -> Result<SeqToken, SessionError> {
        if self.members.remove(member_id).is_none() {
            return Err(SessionError::MemberNotInSession(member_id.to_string()));
        }

        let mut spec = OperationSpec::new(REMOVE_MEMBER, member_id);
        spec.set_timestamp(timestamp);
        let seq = self.append(None, [spec]);
        debug!(title = %self.title, member_id, seq = %seq, "member removed");
        Ok(seq)
    }

    /// Append a member's operations if it has seen the current log state.
    ///
    /// An empty batch is always accepted and leaves the log untouched.
    pub fn push(
        &mut self,
        member_id: &str,
        expected: &SeqToken,
        specs: Vec<OperationSpec>,
    ) -> Result<SeqToken, SessionError> {
        if !self.has_member(member_id) {
            return Err(SessionError::MemberNotInSession(member_id.to_string()));
        }
        if specs.is_empty() {
            return Ok(self.sequence_token());
        }

        let current = self.sequence_token();
        if *expected != current {
            trace!(member_id, expected = %current, presented = %expected, "stale push");
            return Err(SessionError::SeqOutOfDate {
                expected: current,
                presented: expected.clone(),
            });
        }

        let count = specs.len();
        let seq = self.append(Some(member_id), specs);
        // The pusher already has its own operations.
        let end = self.operations.len();
        if let Some(member) = self.members.get_mut(member_id) {
            member.cursor = end;
        }

        debug!(title = %self.title, member_id, seq = %seq, count, "operations appended");
        Ok(seq)
    }

    /// Everything the member has not received yet, marking it received.
    pub fn get_remote_changes(&mut self, member_id: &str) -> Result<RemoteChanges, SessionError> {
        let end = self.operations.len();
        let member = self
            .members
            .get_mut(member_id)
            .ok_or_else(|| SessionError::MemberNotInSession(member_id.to_string()))?;

        let specs = self.operations[member.cursor..end].to_vec();
        member.cursor = end;

        Ok(RemoteChanges {
            specs,
            sequence_id: self.sequence_token(),
        })
    }

    /// Operations appended after the log state `seq_head` that the member
    /// did not push itself.
    ///
    /// Nothing from before the member's join is returned. A token this log
    /// did not issue counts as "nothing seen since the join". Asking twice
    /// with the same token yields the same operations.
    pub fn changes_since(
        &mut self,
        member_id: &str,
        seq_head: &SeqToken,
    ) -> Result<RemoteChanges, SessionError> {
        let end = self.operations.len();
        let member = self
            .members
            .get_mut(member_id)
            .ok_or_else(|| SessionError::MemberNotInSession(member_id.to_string()))?;
        member.cursor = end;
        let joined_at = member.joined_at;

        let seen = seq_head
            .counter()
            .and_then(|counter| usize::try_from(counter).ok())
            .filter(|counter| *counter <= self.appends.len())
            .unwrap_or(0);

        let specs = self.appends[seen..]
            .iter()
            .filter(|append| append.start >= joined_at)
            .filter(|append| append.pusher.as_deref() != Some(member_id))
            .flat_map(|append| self.operations[append.start..append.end].iter().cloned())
            .collect();

        Ok(RemoteChanges {
            specs,
            sequence_id: self.sequence_token(),
        })
    }

    /// Serve one synchronization round for a member.
    ///
    /// An empty `client_ops` polls for new operations. Otherwise the batch is
    /// appended if `seq_head` is current, or a conflict is reported together
    /// with the operations the member is missing. Operations are always
    /// counted from `seq_head`, so repeating a request is harmless.
    pub fn sync_ops(
        &mut self,
        member_id: &str,
        seq_head: &SeqToken,
        client_ops: Vec<OperationSpec>,
    ) -> Result<SyncOpsResponse, SessionError> {
        if client_ops.is_empty() {
            let changes = self.changes_since(member_id, seq_head)?;
            return Ok(SyncOpsResponse::new_ops(changes.sequence_id, changes.specs));
        }

        match self.push(member_id, seq_head, client_ops) {
            Ok(head_seq) => Ok(SyncOpsResponse::added(head_seq)),
            Err(SessionError::SeqOutOfDate { .. }) => {
                let changes = self.changes_since(member_id, seq_head)?;
                Ok(SyncOpsResponse::conflict(changes.sequence_id, changes.specs))
            }
            Err(err) => Err(err),
        }
    }
}
