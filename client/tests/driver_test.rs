//! Integration tests for the session driver.
//!
//! Clients talk to an in-process session manager, or to a real server on
//! an ephemeral port for the HTTP transport.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use odfsync_client::{
    ClientConfig, ClientError, ClientEvent, HttpTransport, SessionClient, SessionTransport,
    SharedDocument, TransportError,
};
use odfsync_engine::textops::{self, TextDocument, TextOperation, TextOperationFactory};
use odfsync_engine::{
    MemberId, RouterConfig, RouterError, RouterEvent, SeqToken, SessionError, SyncOpsRequest,
    SyncOpsResponse,
};
use odfsync_server::{build_app, AppError, AppState, Config, SessionManager};

type TextClient<T> = SessionClient<TextOperation, T>;

/// Session manager called in-process, optionally failing the first
/// `sync_ops` calls as if the network were down.
struct LocalTransport {
    sessions: Arc<SessionManager>,
    failures_left: AtomicUsize,
    sync_calls: AtomicUsize,
}

impl LocalTransport {
    fn new(sessions: Arc<SessionManager>) -> Self {
        Self::failing(sessions, 0)
    }

    fn failing(sessions: Arc<SessionManager>, failures: usize) -> Self {
        Self {
            sessions,
            failures_left: AtomicUsize::new(failures),
            sync_calls: AtomicUsize::new(0),
        }
    }
}

fn status_error(err: SessionError) -> TransportError {
    let status = match err {
        SessionError::ServiceUnavailable => 503,
        SessionError::SessionNotFound(_) => 404,
        _ => 409,
    };
    TransportError::Status {
        status,
        body: err.code().to_string(),
    }
}

impl SessionTransport for LocalTransport {
    async fn join_session(&self, session_id: &str, user_id: &str) -> Result<MemberId, TransportError> {
        self.sessions
            .join_session(session_id, user_id)
            .await
            .map_err(status_error)
    }

    async fn leave_session(&self, session_id: &str, member_id: &str) -> Result<(), TransportError> {
        self.sessions
            .leave_session(session_id, member_id)
            .await
            .map_err(status_error)
    }

    async fn sync_ops(&self, request: SyncOpsRequest) -> Result<SyncOpsResponse, TransportError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Unreachable("connection refused".into()));
        }

        self.sessions.sync_ops(request).await.map_err(status_error)
    }

    async fn write_session_state(
        &self,
        session_id: &str,
        member_id: &str,
        seq: &SeqToken,
        document: Vec<u8>,
    ) -> Result<(), TransportError> {
        match self
            .sessions
            .write_session_state_to_file(session_id, member_id, seq, &document)
            .await
        {
            Ok(_) => Ok(()),
            Err(AppError::Session(err)) => Err(status_error(err)),
            Err(err) => Err(TransportError::Status {
                status: 500,
                body: err.to_string(),
            }),
        }
    }
}

fn state_dir() -> PathBuf {
    std::env::temp_dir().join(format!("odfsync-client-{}", uuid::Uuid::new_v4()))
}

fn config() -> ClientConfig {
    ClientConfig {
        router: RouterConfig {
            sync_ops_delay: Duration::from_millis(10),
            idle_delay: Duration::from_millis(200),
            replay_time: Duration::from_millis(500),
            max_retry_delay: Duration::from_millis(40),
        },
        request_timeout: Some(Duration::from_secs(5)),
        close_timeout: Some(Duration::from_secs(5)),
    }
}

async fn join<T: SessionTransport>(
    transport: &Arc<T>,
    user: &str,
) -> (TextClient<T>, SharedDocument<TextDocument>) {
    let document = SharedDocument::new(TextDocument::default());
    let client = SessionClient::join(
        Arc::clone(transport),
        "doc",
        user,
        TextOperationFactory,
        document.clone(),
        textops::transformer(),
        config(),
    )
    .await
    .unwrap();
    (client, document)
}

fn text(document: &SharedDocument<TextDocument>) -> String {
    document.read(|doc| doc.text().to_string())
}

async fn sync_until_converged<T: SessionTransport>(
    clients: &[&TextClient<T>],
    documents: &[&SharedDocument<TextDocument>],
) {
    for _ in 0..10 {
        for client in clients {
            client.sync().await.unwrap();
        }
        let first = text(documents[0]);
        if documents.iter().all(|doc| text(doc) == first) {
            return;
        }
    }
    panic!("documents did not converge");
}

async fn drain_events<T: SessionTransport>(client: &mut TextClient<T>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(100), client.next_event()).await
    {
        events.push(event);
    }
    events
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn test_two_members_converge() {
    let sessions = SessionManager::new_shared("Session", state_dir());
    let transport = Arc::new(LocalTransport::new(Arc::clone(&sessions)));

    let (alice, doc_a) = join(&transport, "alice").await;
    let (bob, doc_b) = join(&transport, "bob").await;
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    let accepted = alice
        .push(vec![TextOperation::insert_text(alice.member_id(), 0, "hello")])
        .await
        .unwrap();
    assert!(accepted);
    bob.push(vec![TextOperation::insert_text(bob.member_id(), 0, "world ")])
        .await
        .unwrap();

    sync_until_converged(&[&alice, &bob], &[&doc_a, &doc_b]).await;

    let merged = text(&doc_a);
    assert_eq!(merged.len(), "hello".len() + "world ".len());
    assert!(merged.contains("hello"));
    assert!(merged.contains("world "));
    doc_b.read(|doc| {
        assert!(doc.members().contains(alice.member_id()));
        assert!(doc.members().contains(bob.member_id()));
    });
}

// ============================================================================
// Closing
// ============================================================================

#[tokio::test]
async fn test_close_saves_snapshot_and_leaves() {
    let dir = state_dir();
    let sessions = SessionManager::new_shared("Session", dir.clone());
    let transport = Arc::new(LocalTransport::new(Arc::clone(&sessions)));

    let (alice, _doc) = join(&transport, "alice").await;
    let member = alice.member_id().to_string();
    alice
        .push(vec![TextOperation::insert_text(member.clone(), 0, "draft")])
        .await
        .unwrap();

    let events = alice.close().await.unwrap();

    assert!(events.contains(&ClientEvent::Router(RouterEvent::Closed {
        save_snapshot: true
    })));
    let seq = events
        .iter()
        .find_map(|event| match event {
            ClientEvent::SavedToFile { seq } => Some(seq.clone()),
            _ => None,
        })
        .expect("snapshot saved");

    let stored = tokio::fs::read(dir.join("doc").join(format!("{seq}.odt")))
        .await
        .unwrap();
    assert_eq!(stored, b"draft");
    assert!(!sessions.get_member_ids("doc").await.unwrap().contains(&member));

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn test_close_without_edits_skips_snapshot() {
    let sessions = SessionManager::new_shared("Session", state_dir());
    let transport = Arc::new(LocalTransport::new(Arc::clone(&sessions)));

    let (alice, _doc) = join(&transport, "alice").await;
    alice.sync().await.unwrap();
    let events = alice.close().await.unwrap();

    assert!(events.contains(&ClientEvent::Router(RouterEvent::Closed {
        save_snapshot: false
    })));
    assert!(!events
        .iter()
        .any(|event| matches!(event, ClientEvent::SavedToFile { .. })));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_retries_while_host_unreachable() {
    let sessions = SessionManager::new_shared("Session", state_dir());
    let transport = Arc::new(LocalTransport::failing(Arc::clone(&sessions), 2));

    let (mut alice, doc) = join(&transport, "alice").await;
    alice
        .push(vec![TextOperation::insert_text(alice.member_id(), 0, "offline")])
        .await
        .unwrap();
    alice.sync().await.unwrap();

    assert!(transport.sync_calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(text(&doc), "offline");

    let events = drain_events(&mut alice).await;
    let lost = events
        .iter()
        .position(|e| *e == ClientEvent::Router(RouterEvent::HasSessionHostConnectionChanged(false)))
        .expect("connection loss reported");
    let regained = events
        .iter()
        .position(|e| *e == ClientEvent::Router(RouterEvent::HasSessionHostConnectionChanged(true)))
        .expect("reconnection reported");
    assert!(lost < regained);
}

#[tokio::test]
async fn test_close_gives_up_while_host_unreachable() {
    let sessions = SessionManager::new_shared("Session", state_dir());
    let transport = Arc::new(LocalTransport::failing(Arc::clone(&sessions), usize::MAX));

    let document = SharedDocument::new(TextDocument::default());
    let alice: TextClient<LocalTransport> = SessionClient::join(
        Arc::clone(&transport),
        "doc",
        "alice",
        TextOperationFactory,
        document,
        textops::transformer(),
        ClientConfig {
            close_timeout: Some(Duration::from_millis(300)),
            ..config()
        },
    )
    .await
    .unwrap();
    let member = alice.member_id().to_string();
    alice
        .push(vec![TextOperation::insert_text(member.clone(), 0, "unsent")])
        .await
        .unwrap();

    let err = alice.close().await.unwrap_err();
    assert!(matches!(err, ClientError::CloseTimedOut(limit) if limit == Duration::from_millis(300)));
    assert!(transport.sync_calls.load(Ordering::SeqCst) >= 2);
    assert!(sessions.get_member_ids("doc").await.unwrap().contains(&member));
}

#[tokio::test]
async fn test_removed_member_stops_driver() {
    let sessions = SessionManager::new_shared("Session", state_dir());
    let transport = Arc::new(LocalTransport::new(Arc::clone(&sessions)));

    let (mut alice, _doc) = join(&transport, "alice").await;
    alice.sync().await.unwrap();
    sessions
        .leave_session("doc", alice.member_id())
        .await
        .unwrap();

    let err = alice.sync().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::SyncCancelled | ClientError::DriverStopped
    ));

    let mut events = Vec::new();
    while let Some(event) = alice.next_event().await {
        events.push(event);
    }
    assert!(events.contains(&ClientEvent::Router(RouterEvent::Error(
        RouterError::NotMemberOfSession
    ))));

    let err = alice
        .push(vec![TextOperation::insert_text(alice.member_id(), 0, "late")])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::DriverStopped));
}

// ============================================================================
// HTTP
// ============================================================================

#[tokio::test]
async fn test_http_transport_end_to_end() {
    let dir = state_dir();
    let app = build_app(AppState::new(Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        state_dir: dir.clone(),
        session_title_prefix: "Session".to_string(),
    }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let transport = Arc::new(HttpTransport::new(format!("http://{addr}")));
    let (alice, doc_a) = join(&transport, "alice").await;
    let (bob, doc_b) = join(&transport, "bob").await;

    alice
        .push(vec![TextOperation::insert_text(alice.member_id(), 0, "abc")])
        .await
        .unwrap();
    sync_until_converged(&[&alice, &bob], &[&doc_a, &doc_b]).await;

    bob.push(vec![TextOperation::remove_text(bob.member_id(), 1, 1)])
        .await
        .unwrap();
    sync_until_converged(&[&bob, &alice], &[&doc_a, &doc_b]).await;
    assert_eq!(text(&doc_a), "ac");

    let events = bob.close().await.unwrap();
    assert!(events
        .iter()
        .any(|event| matches!(event, ClientEvent::SavedToFile { .. })));
    alice.close().await.unwrap();

    let _ = tokio::fs::remove_dir_all(&dir).await;
}
