//! Client-side operation router.
//!
//! One [`OperationRouter`] exists per member and session. It applies local
//! operations optimistically, batches them for upload, reconciles them with
//! operations other members got accepted first, and plays remote
//! operations back into the local document.
//!
//! The router performs no IO. A driver feeds it the current time and the
//! results of the `sync_ops` calls it asked for:
//!
//! - [`poll_transmit`](OperationRouter::poll_transmit) yields the next
//!   request to send; at most one is outstanding at any time
//! - [`poll_timeout`](OperationRouter::poll_timeout) tells when
//!   [`handle_timeout`](OperationRouter::handle_timeout) must be called
//! - [`handle_sync_response`](OperationRouter::handle_sync_response) and
//!   [`handle_sync_failure`](OperationRouter::handle_sync_failure) complete
//!   the outstanding request
//! - [`continue_playback`](OperationRouter::continue_playback) applies the
//!   next time slice of remote operations while
//!   [`has_pending_playback`](OperationRouter::has_pending_playback) holds
//! - [`poll_event`](OperationRouter::poll_event) yields notifications

use crate::protocol::{ENOMEMBER, ENOSESSION};
use crate::{
    MemberId, Operation, OperationFactory, OperationSpec, OperationTransformer, Playback,
    RouterError, SeqToken, SessionId, SyncOpsRequest, SyncOpsResponse, SyncResult, Timestamp,
};
use futures::channel::oneshot;
use std::collections::VecDeque;
use std::mem;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Timing of the synchronization rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Delay between queuing local operations and uploading them.
    pub sync_ops_delay: Duration,
    /// Quiet period before polling when nothing is queued.
    pub idle_delay: Duration,
    /// Upper bound of one playback time slice.
    pub replay_time: Duration,
    /// Upper bound of the retry delay after network failures.
    pub max_retry_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sync_ops_delay: Duration::from_millis(3000),
            idle_delay: Duration::from_millis(5000),
            replay_time: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

/// Scheduling state of a router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterState {
    /// Nothing queued; at `wake_at` a poll gets scheduled.
    Idle { wake_at: Instant },
    /// A sync round starts at `sync_at`.
    SyncScheduled { sync_at: Instant },
    /// A `sync_ops` request is outstanding.
    SyncInFlight,
    /// Waiting for the final round before closing; retries at `retry_at`.
    Closing { retry_at: Option<Instant> },
    /// Closed; no more rounds.
    Closed,
    /// Local and remote operations could not be reconciled.
    UnresolvableConflict,
    /// Stopped by a fatal error.
    Failed(RouterError),
}

impl RouterState {
    /// Whether the router stopped for good because of an error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::UnresolvableConflict | Self::Failed(_))
    }
}

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    HasLocalUnsyncedOpsChanged(bool),
    HasSessionHostConnectionChanged(bool),
    /// The document is about to be modified by a batch of operations.
    ProcessingBatchStart,
    ProcessingBatchEnd,
    /// A snapshot of the document is about to be taken.
    BeforeSaveToFile,
    /// The router stopped. Reported once.
    Error(RouterError),
    /// The router closed; the document should be persisted if
    /// `save_snapshot` is set.
    Closed { save_snapshot: bool },
}

/// Why a `sync_ops` request produced no response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /// The server could not be reached or is unavailable. Retried.
    Unreachable(String),
    /// The server answered with something that is not a sync reply. Fatal.
    Malformed(String),
}

#[derive(Debug)]
enum SyncWaiter {
    Notify(oneshot::Sender<()>),
    Close,
}

#[derive(Debug)]
struct InFlight {
    client_ops: Vec<OperationSpec>,
    waiters: Vec<SyncWaiter>,
}

pub struct OperationRouter<F, P> {
    session_id: SessionId,
    member_id: MemberId,
    factory: F,
    playback: P,
    transformer: OperationTransformer,
    config: RouterConfig,

    state: RouterState,
    last_server_seq: SeqToken,
    unsynced_client_ops: Vec<OperationSpec>,
    unplayed_server_ops: VecDeque<OperationSpec>,
    /// Waiting for the next round to start.
    sync_waiters: Vec<SyncWaiter>,
    in_flight: Option<InFlight>,
    /// Round finished, waiting for playback to drain.
    unfired_waiters: Vec<SyncWaiter>,
    outgoing: VecDeque<SyncOpsRequest>,
    events: VecDeque<RouterEvent>,

    instant_sync_requested: bool,
    closing: bool,
    failed_attempts: u32,
    has_local_unsynced_ops: bool,
    has_session_host_connection: bool,
    has_pushed_modification_ops: bool,
}

impl<F, P> OperationRouter<F, P>
where
    F: OperationFactory,
    P: Playback<F::Op>,
{
    pub fn new(
        session_id: impl Into<SessionId>,
        member_id: impl Into<MemberId>,
        factory: F,
        playback: P,
        transformer: OperationTransformer,
        config: RouterConfig,
        now: Instant,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            member_id: member_id.into(),
            factory,
            playback,
            transformer,
            config,
            state: RouterState::Idle {
                wake_at: now + config.idle_delay,
            },
            last_server_seq: SeqToken::default(),
            unsynced_client_ops: Vec::new(),
            unplayed_server_ops: VecDeque::new(),
            sync_waiters: Vec::new(),
            in_flight: None,
            unfired_waiters: Vec::new(),
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
            instant_sync_requested: false,
            closing: false,
            failed_attempts: 0,
            has_local_unsynced_ops: false,
            has_session_host_connection: true,
            has_pushed_modification_ops: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn state(&self) -> &RouterState {
        &self.state
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn last_server_seq(&self) -> &SeqToken {
        &self.last_server_seq
    }

    pub fn has_local_unsynced_ops(&self) -> bool {
        self.has_local_unsynced_ops
    }

    pub fn has_session_host_connection(&self) -> bool {
        self.has_session_host_connection
    }

    /// Whether any pushed operation modified document content.
    pub fn has_pushed_modification_ops(&self) -> bool {
        self.has_pushed_modification_ops
    }

    pub fn unsynced_ops(&self) -> &[OperationSpec] {
        &self.unsynced_client_ops
    }

    pub fn playback(&self) -> &P {
        &self.playback
    }

    pub fn playback_mut(&mut self) -> &mut P {
        &mut self.playback
    }

    fn is_stopped(&self) -> bool {
        self.state.is_terminal() || self.state == RouterState::Closed
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    /// Apply local operations and queue them for upload.
    ///
    /// Returns `Ok(false)` without touching anything while remote
    /// operations are still waiting to be played back.
    pub fn push(
        &mut self,
        operations: Vec<F::Op>,
        timestamp: Timestamp,
        now: Instant,
    ) -> Result<bool, RouterError> {
        match &self.state {
            RouterState::UnresolvableConflict => return Err(RouterError::UnresolvableConflict),
            RouterState::Failed(err) => return Err(err.clone()),
            RouterState::Closed => return Err(RouterError::Closed),
            _ if self.closing => return Err(RouterError::Closed),
            _ => {}
        }
        if !self.unplayed_server_ops.is_empty() {
            debug!(
                member_id = %self.member_id,
                pending = self.unplayed_server_ops.len(),
                "dropping local operations during playback"
            );
            return Ok(false);
        }

        self.events.push_back(RouterEvent::ProcessingBatchStart);

        for op in operations {
            self.has_pushed_modification_ops |= op.is_edit();

            let mut spec = op.spec();
            spec.set_timestamp(timestamp);
            let Some(op) = self.factory.create(&spec) else {
                warn!(optype = spec.optype(), "skipping local operation the factory rejects");
                continue;
            };

            if let Err(err) = self.playback.play(&op) {
                self.events.push_back(RouterEvent::ProcessingBatchEnd);
                let err = RouterError::OpExecutionFailure(err.to_string());
                self.fail(err.clone());
                return Err(err);
            }
            self.unsynced_client_ops.push(spec);
        }

        if let RouterState::Idle { .. } = self.state {
            self.state = RouterState::SyncScheduled {
                sync_at: now + self.config.sync_ops_delay,
            };
        }
        self.update_has_local_unsynced_ops();
        self.events.push_back(RouterEvent::ProcessingBatchEnd);

        trace!(member_id = %self.member_id, queued = self.unsynced_client_ops.len(), "local operations queued");
        Ok(true)
    }

    /// Start a sync round as soon as possible.
    ///
    /// The receiver completes once a full round trip finished and all
    /// operations received by it were played back. It is cancelled if the
    /// router stops first.
    pub fn request_instant_sync(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.is_stopped() {
            return rx;
        }

        self.sync_waiters.push(SyncWaiter::Notify(tx));
        self.instant_sync_requested = true;
        self.sync_ops();
        rx
    }

    /// Close the router.
    ///
    /// Outstanding local operations are synced first. Completion is
    /// reported by a [`RouterEvent::Closed`].
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            self.events
                .push_back(RouterEvent::Closed { save_snapshot: false });
            return;
        }
        if self.closing || self.state == RouterState::Closed {
            return;
        }

        if self.has_local_unsynced_ops {
            debug!(member_id = %self.member_id, "syncing before close");
            self.closing = true;
            self.sync_waiters.push(SyncWaiter::Close);
            self.instant_sync_requested = true;
            self.sync_ops();
        } else {
            self.finish_close();
        }
    }

    fn finish_close(&mut self) {
        self.closing = false;
        self.state = RouterState::Closed;
        self.sync_waiters.clear();
        self.unfired_waiters.clear();

        let save_snapshot = self.has_pushed_modification_ops;
        if save_snapshot {
            self.events.push_back(RouterEvent::BeforeSaveToFile);
        }
        self.events.push_back(RouterEvent::Closed { save_snapshot });
        debug!(member_id = %self.member_id, save_snapshot, "router closed");
    }

    // ------------------------------------------------------------------
    // Sync rounds
    // ------------------------------------------------------------------

    fn sync_ops(&mut self) {
        if self.in_flight.is_some() || self.is_stopped() {
            return;
        }

        self.instant_sync_requested = false;
        let client_ops = mem::take(&mut self.unsynced_client_ops);
        let waiters = mem::take(&mut self.sync_waiters);

        debug!(
            session_id = %self.session_id,
            member_id = %self.member_id,
            seq_head = %self.last_server_seq,
            count = client_ops.len(),
            "sending sync_ops"
        );

        self.outgoing.push_back(SyncOpsRequest {
            es_id: self.session_id.clone(),
            member_id: self.member_id.clone(),
            seq_head: self.last_server_seq.clone(),
            client_ops: client_ops.clone(),
        });
        self.in_flight = Some(InFlight {
            client_ops,
            waiters,
        });
        self.state = RouterState::SyncInFlight;
    }

    /// Next request to send.
    pub fn poll_transmit(&mut self) -> Option<SyncOpsRequest> {
        self.outgoing.pop_front()
    }

    /// Deadline of the pending timer, if any.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.state {
            RouterState::Idle { wake_at } => Some(wake_at),
            RouterState::SyncScheduled { sync_at } => Some(sync_at),
            RouterState::Closing { retry_at } => retry_at,
            _ => None,
        }
    }

    /// Fire timers that expired at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        match self.state {
            RouterState::Idle { wake_at } if now >= wake_at => {
                self.state = RouterState::SyncScheduled {
                    sync_at: now + self.config.sync_ops_delay,
                };
            }
            RouterState::SyncScheduled { sync_at } if now >= sync_at => self.sync_ops(),
            RouterState::Closing {
                retry_at: Some(retry_at),
            } if now >= retry_at => self.sync_ops(),
            _ => {}
        }
    }

    /// Complete the outstanding request with the server's reply.
    pub fn handle_sync_response(&mut self, response: SyncOpsResponse, now: Instant) {
        let Some(InFlight {
            client_ops,
            waiters,
        }) = self.in_flight.take()
        else {
            warn!(member_id = %self.member_id, "sync reply without request");
            return;
        };

        self.set_session_host_connection(true);
        if self.is_stopped() {
            return;
        }
        self.failed_attempts = 0;

        trace!(member_id = %self.member_id, result = ?response.result, head_seq = %response.head_seq, ops = response.ops.len(), "sync_ops reply");

        let mut resolved = true;
        match response.result {
            SyncResult::NewOps => {
                if response.ops.is_empty() {
                    self.unfired_waiters.extend(waiters);
                } else {
                    if self.unsynced_client_ops.is_empty() {
                        self.unplayed_server_ops.extend(response.ops);
                        self.unfired_waiters.extend(waiters);
                    } else {
                        debug!(member_id = %self.member_id, "local operations queued meanwhile, transforming");
                        resolved = self.transform_unsynced(&response.ops);
                        self.requeue_waiters(waiters);
                    }
                    self.last_server_seq = response.head_seq;
                }
            }
            SyncResult::Added => {
                self.unfired_waiters.extend(waiters);
                self.last_server_seq = response.head_seq;
            }
            SyncResult::Conflict => {
                debug!(member_id = %self.member_id, "server has new operations, transforming");
                self.requeue_batch(client_ops);
                self.requeue_waiters(waiters);
                resolved = self.transform_unsynced(&response.ops);
                self.last_server_seq = response.head_seq;
                if resolved {
                    self.instant_sync_requested = true;
                }
            }
            SyncResult::Error => {
                let err = match response.error.as_deref() {
                    Some(ENOSESSION) => RouterError::SessionDoesNotExist,
                    Some(ENOMEMBER) => RouterError::NotMemberOfSession,
                    other => RouterError::UnknownServerReply(other.unwrap_or("error").to_string()),
                };
                self.fail(err);
                return;
            }
        }

        if !resolved {
            self.fail(RouterError::UnresolvableConflict);
            return;
        }

        self.update_has_local_unsynced_ops();
        self.schedule_next_sync(now);
        self.continue_playback();
    }

    /// Complete the outstanding request that did not get a reply.
    pub fn handle_sync_failure(&mut self, failure: SyncFailure, now: Instant) {
        let Some(InFlight {
            client_ops,
            waiters,
        }) = self.in_flight.take()
        else {
            return;
        };
        if self.is_stopped() {
            return;
        }

        match failure {
            SyncFailure::Malformed(reply) => {
                error!(member_id = %self.member_id, %reply, "could not parse sync reply");
                self.fail(RouterError::UnknownServerReply(reply));
            }
            SyncFailure::Unreachable(reason) => {
                self.set_session_host_connection(false);
                self.requeue_batch(client_ops);
                self.requeue_waiters(waiters);
                self.instant_sync_requested = false;

                self.failed_attempts = self.failed_attempts.saturating_add(1);
                let retry_at = now + self.retry_delay();
                warn!(
                    member_id = %self.member_id,
                    %reason,
                    attempts = self.failed_attempts,
                    "session host unreachable"
                );

                self.state = if self.closing {
                    RouterState::Closing {
                        retry_at: Some(retry_at),
                    }
                } else {
                    RouterState::SyncScheduled { sync_at: retry_at }
                };
                self.continue_playback();
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        let exponent = self.failed_attempts.saturating_sub(1).min(16);
        self.config
            .sync_ops_delay
            .saturating_mul(1 << exponent)
            .min(self.config.max_retry_delay)
    }

    fn schedule_next_sync(&mut self, now: Instant) {
        if self.instant_sync_requested {
            self.sync_ops();
            return;
        }

        let has_unsynced = !self.unsynced_client_ops.is_empty();
        self.state = if self.closing {
            RouterState::Closing {
                retry_at: has_unsynced.then(|| now + self.config.sync_ops_delay),
            }
        } else if has_unsynced {
            RouterState::SyncScheduled {
                sync_at: now + self.config.sync_ops_delay,
            }
        } else {
            RouterState::Idle {
                wake_at: now + self.config.idle_delay,
            }
        };
    }

    fn requeue_batch(&mut self, mut batch: Vec<OperationSpec>) {
        batch.append(&mut self.unsynced_client_ops);
        self.unsynced_client_ops = batch;
    }

    fn requeue_waiters(&mut self, mut waiters: Vec<SyncWaiter>) {
        waiters.append(&mut self.sync_waiters);
        self.sync_waiters = waiters;
    }

    /// Transform the unsynced local operations against server operations.
    fn transform_unsynced(&mut self, server_ops: &[OperationSpec]) -> bool {
        match self
            .transformer
            .transform(&self.unsynced_client_ops, server_ops)
        {
            Ok(result) => {
                self.unplayed_server_ops.extend(result.specs_b);
                self.unsynced_client_ops = result.specs_a;
                true
            }
            Err(err) => {
                error!(member_id = %self.member_id, %err, "cannot transform operations");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------------

    /// Whether remote operations are waiting for
    /// [`continue_playback`](Self::continue_playback).
    pub fn has_pending_playback(&self) -> bool {
        !self.unplayed_server_ops.is_empty() && !self.state.is_terminal()
    }

    /// Apply remote operations for at most one time slice.
    ///
    /// The slice is measured on the monotonic clock from the call onwards,
    /// at least one operation is played per call. Once the queue is empty the waiters of finished rounds are notified
    /// in the order they were registered.
    pub fn continue_playback(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if self.unplayed_server_ops.is_empty() {
            self.fire_waiters();
            return;
        }

        self.events.push_back(RouterEvent::ProcessingBatchStart);
        let started = Instant::now();
        let mut played = 0usize;

        while let Some(spec) = self.unplayed_server_ops.pop_front() {
            match self.factory.create(&spec) {
                Some(op) => {
                    if let Err(err) = self.playback.play(&op) {
                        self.events.push_back(RouterEvent::ProcessingBatchEnd);
                        self.fail(RouterError::OpExecutionFailure(err.to_string()));
                        return;
                    }
                    played += 1;
                }
                None => warn!(optype = spec.optype(), "ignoring invalid incoming operation"),
            }

            if started.elapsed() >= self.config.replay_time {
                break;
            }
        }

        self.events.push_back(RouterEvent::ProcessingBatchEnd);
        trace!(member_id = %self.member_id, played, remaining = self.unplayed_server_ops.len(), "playback slice");

        if self.unplayed_server_ops.is_empty() {
            self.fire_waiters();
        }
    }

    fn fire_waiters(&mut self) {
        let mut close = false;
        for waiter in mem::take(&mut self.unfired_waiters) {
            match waiter {
                SyncWaiter::Notify(tx) => {
                    let _ = tx.send(());
                }
                SyncWaiter::Close => close = true,
            }
        }
        if close {
            self.finish_close();
        }
    }

    // ------------------------------------------------------------------
    // Observables
    // ------------------------------------------------------------------

    /// Next pending notification.
    pub fn poll_event(&mut self) -> Option<RouterEvent> {
        self.events.pop_front()
    }

    fn update_has_local_unsynced_ops(&mut self) {
        let now = !self.unsynced_client_ops.is_empty();
        if self.has_local_unsynced_ops != now {
            self.has_local_unsynced_ops = now;
            self.events
                .push_back(RouterEvent::HasLocalUnsyncedOpsChanged(now));
        }
    }

    fn set_session_host_connection(&mut self, connected: bool) {
        if self.has_session_host_connection != connected {
            self.has_session_host_connection = connected;
            self.events
                .push_back(RouterEvent::HasSessionHostConnectionChanged(connected));
        }
    }

    fn fail(&mut self, err: RouterError) {
        error!(session_id = %self.session_id, member_id = %self.member_id, %err, "operation router stopped");

        self.state = match err {
            RouterError::UnresolvableConflict => RouterState::UnresolvableConflict,
            ref other => RouterState::Failed(other.clone()),
        };
        self.sync_waiters.clear();
        self.unfired_waiters.clear();
        self.in_flight = None;
        self.outgoing.clear();
        self.unplayed_server_ops.clear();
        self.instant_sync_requested = false;

        self.events.push_back(RouterEvent::Error(err));
        if mem::take(&mut self.closing) {
            self.events
                .push_back(RouterEvent::Closed { save_snapshot: false });
        }
    }
}
