//! Runs an operation router on tokio.
//!
//! [`SessionClient`] is the application's handle; the [`SessionDriver`]
//! actor owns the router and is the only task touching it. The driver
//! waits on three things: the reply of the outstanding `sync_ops` call,
//! the router's next timer, and the next playback slice.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::oneshot as waiter;
use futures::future::{BoxFuture, OptionFuture};
use odfsync_engine::{
    timestamp_now, MemberId, OperationFactory, OperationRouter, OperationTransformer, Playback,
    RouterError, RouterEvent, RouterState, SeqToken, SessionId, SyncOpsRequest, SyncOpsResponse,
    Timestamp,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::document::SnapshotSource;
use crate::error::{ClientError, Result, TransportError};
use crate::transport::SessionTransport;

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Router(RouterEvent),
    /// The closing snapshot was stored by the session host.
    SavedToFile { seq: SeqToken },
    /// The closing snapshot could not be stored.
    SaveFailed(TransportError),
}

enum Command<O> {
    Push {
        operations: Vec<O>,
        timestamp: Timestamp,
        reply: oneshot::Sender<std::result::Result<bool, RouterError>>,
    },
    Sync {
        reply: oneshot::Sender<waiter::Receiver<()>>,
    },
    Close,
}

type SyncCall = BoxFuture<'static, std::result::Result<SyncOpsResponse, TransportError>>;

/// The actor driving one router.
pub struct SessionDriver<F: OperationFactory, P, T> {
    router: OperationRouter<F, P>,
    transport: Arc<T>,
    request_timeout: Option<Duration>,
    commands: mpsc::UnboundedReceiver<Command<F::Op>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    in_flight: Option<SyncCall>,
}

impl<F, P, T> SessionDriver<F, P, T>
where
    F: OperationFactory,
    P: Playback<F::Op> + SnapshotSource,
    T: SessionTransport,
{
    pub async fn run(mut self) {
        let mut commands_open = true;

        loop {
            self.dispatch().await;
            if self.is_finished() {
                break;
            }

            let timer = self
                .router
                .poll_timeout()
                .map(|at| tokio::time::sleep_until(at.into()));
            let playback = self.router.has_pending_playback();

            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!(member_id = %self.router.member_id(), "session handle dropped");
                        commands_open = false;
                        self.router.close();
                    }
                },
                Some(result) = OptionFuture::from(self.in_flight.as_mut()) => {
                    self.in_flight = None;
                    self.handle_reply(result);
                }
                Some(()) = OptionFuture::from(timer) => {
                    self.router.handle_timeout(Instant::now());
                }
                _ = tokio::task::yield_now(), if playback => {
                    self.router.continue_playback();
                }
                else => break,
            }
        }

        info!(
            session_id = %self.router.session_id(),
            member_id = %self.router.member_id(),
            state = ?self.router.state(),
            "session driver stopped"
        );
    }

    fn is_finished(&self) -> bool {
        let state = self.router.state();
        *state == RouterState::Closed || state.is_terminal()
    }

    /// Send the router's next request and forward its events.
    async fn dispatch(&mut self) {
        if self.in_flight.is_none() {
            if let Some(request) = self.router.poll_transmit() {
                self.in_flight = Some(self.send(request));
            }
        }

        while let Some(event) = self.router.poll_event() {
            let save_snapshot = matches!(event, RouterEvent::Closed { save_snapshot: true });
            self.emit(ClientEvent::Router(event));
            if save_snapshot {
                self.save_snapshot().await;
            }
        }
    }

    fn send(&self, request: SyncOpsRequest) -> SyncCall {
        let transport = Arc::clone(&self.transport);
        let timeout = self.request_timeout;

        Box::pin(async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, transport.sync_ops(request))
                    .await
                    .map_err(|_| TransportError::Timeout(limit))?,
                None => transport.sync_ops(request).await,
            }
        })
    }

    fn handle_command(&mut self, command: Command<F::Op>) {
        match command {
            Command::Push {
                operations,
                timestamp,
                reply,
            } => {
                let result = self.router.push(operations, timestamp, Instant::now());
                let _ = reply.send(result);
            }
            Command::Sync { reply } => {
                let _ = reply.send(self.router.request_instant_sync());
            }
            Command::Close => self.router.close(),
        }
    }

    fn handle_reply(&mut self, result: std::result::Result<SyncOpsResponse, TransportError>) {
        match result {
            Ok(reply) => self.router.handle_sync_response(reply, Instant::now()),
            Err(err) => {
                warn!(member_id = %self.router.member_id(), %err, "sync_ops failed");
                self.router
                    .handle_sync_failure(err.into_sync_failure(), Instant::now());
            }
        }
    }

    async fn save_snapshot(&mut self) {
        let session_id = self.router.session_id().to_string();
        let member_id = self.router.member_id().to_string();
        let seq = self.router.last_server_seq().clone();
        let document = self.router.playback().snapshot();

        match self
            .transport
            .write_session_state(&session_id, &member_id, &seq, document)
            .await
        {
            Ok(()) => {
                info!(session_id = %session_id, member_id = %member_id, seq = %seq, "snapshot saved");
                self.emit(ClientEvent::SavedToFile { seq });
            }
            Err(err) => {
                warn!(session_id = %session_id, member_id = %member_id, %err, "snapshot not saved");
                self.emit(ClientEvent::SaveFailed(err));
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

/// Handle of one member in one session.
pub struct SessionClient<O, T> {
    session_id: SessionId,
    member_id: MemberId,
    transport: Arc<T>,
    commands: mpsc::UnboundedSender<Command<O>>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    close_timeout: Option<Duration>,
    driver: JoinHandle<()>,
}

impl<O, T> SessionClient<O, T>
where
    O: Send + 'static,
    T: SessionTransport,
{
    /// Join `session_id` as `user_id` and start syncing `playback`.
    pub async fn join<F, P>(
        transport: Arc<T>,
        session_id: &str,
        user_id: &str,
        factory: F,
        playback: P,
        transformer: OperationTransformer,
        config: ClientConfig,
    ) -> Result<Self>
    where
        F: OperationFactory<Op = O> + Send + 'static,
        P: Playback<O> + SnapshotSource + Send + 'static,
    {
        let member_id = transport.join_session(session_id, user_id).await?;
        info!(session_id, user_id, member_id = %member_id, "joined session");

        let router = OperationRouter::new(
            session_id,
            member_id,
            factory,
            playback,
            transformer,
            config.router,
            Instant::now(),
        );
        Ok(Self::start(router, transport, config))
    }

    /// Drive a router whose member already joined.
    pub fn start<F, P>(
        router: OperationRouter<F, P>,
        transport: Arc<T>,
        config: ClientConfig,
    ) -> Self
    where
        F: OperationFactory<Op = O> + Send + 'static,
        P: Playback<O> + SnapshotSource + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session_id = router.session_id().to_string();
        let member_id = router.member_id().to_string();
        let driver = SessionDriver {
            router,
            transport: Arc::clone(&transport),
            request_timeout: config.request_timeout,
            commands: command_rx,
            events: event_tx,
            in_flight: None,
        };

        Self {
            session_id,
            member_id,
            transport,
            commands: command_tx,
            events: event_rx,
            close_timeout: config.close_timeout,
            driver: tokio::spawn(driver.run()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Apply local operations and queue them for upload.
    ///
    /// `Ok(false)` means they were dropped because remote operations are
    /// being played back.
    pub async fn push(&self, operations: Vec<O>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Push {
                operations,
                timestamp: timestamp_now(),
                reply,
            })
            .map_err(|_| ClientError::DriverStopped)?;

        let accepted = rx.await.map_err(|_| ClientError::DriverStopped)??;
        Ok(accepted)
    }

    /// Sync now and wait until the round trip was played back.
    pub async fn sync(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Sync { reply })
            .map_err(|_| ClientError::DriverStopped)?;

        let done = rx.await.map_err(|_| ClientError::DriverStopped)?;
        done.await.map_err(|_| ClientError::SyncCancelled)
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }

    /// Close the router, then leave the session.
    ///
    /// Waits for the last local operations and the closing snapshot to be
    /// uploaded. While the host is unreachable the router keeps retrying,
    /// so the wait is bounded by [`ClientConfig::close_timeout`]. When it
    /// runs out the driver is stopped, the member stays in the session and
    /// [`ClientError::CloseTimedOut`] is returned. Otherwise returns the
    /// events not consumed yet.
    pub async fn close(mut self) -> Result<Vec<ClientEvent>> {
        // A stopped driver has nothing left to flush.
        let _ = self.commands.send(Command::Close);

        let finished = match self.close_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.driver).await {
                Ok(finished) => finished,
                Err(_) => {
                    self.driver.abort();
                    warn!(member_id = %self.member_id, ?limit, "session driver did not close in time");
                    return Err(ClientError::CloseTimedOut(limit));
                }
            },
            None => (&mut self.driver).await,
        };
        if let Err(err) = finished {
            warn!(member_id = %self.member_id, %err, "session driver panicked");
        }

        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }

        self.transport
            .leave_session(&self.session_id, &self.member_id)
            .await?;
        info!(session_id = %self.session_id, member_id = %self.member_id, "left session");

        Ok(events)
    }
}
