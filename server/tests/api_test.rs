//! Integration tests for the session RPCs over HTTP.
//!
//! Each test starts the server on an ephemeral port.

use std::path::PathBuf;

use odfsync_engine::{
    JoinSessionResponse, SeqToken, SessionInfo, SyncOpsRequest, SyncOpsResponse, SyncResult,
};
use odfsync_server::{build_app, AppState, Config};
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base: String,
    state_dir: PathBuf,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let state_dir = std::env::temp_dir().join(format!("odfsync-api-{}", uuid::Uuid::new_v4()));
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            state_dir: state_dir.clone(),
            session_title_prefix: "Meeting".to_string(),
        };
        let app = build_app(AppState::new(config));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            state_dir,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn join(&self, session: &str, user: &str) -> String {
        let response = self
            .client
            .post(self.url(&format!("/sessions/{session}/join")))
            .json(&json!({ "user_id": user }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.json::<JoinSessionResponse>().await.unwrap().member_id
    }

    async fn sync(&self, session: &str, request: &SyncOpsRequest) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/sessions/{session}/sync_ops")))
            .json(request)
            .send()
            .await
            .unwrap()
    }

    async fn sync_ok(&self, request: &SyncOpsRequest) -> SyncOpsResponse {
        let response = self.sync(&request.es_id, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        response.json().await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.state_dir);
    }
}

fn request(session: &str, member: &str, seq_head: &SeqToken, ops: Vec<Value>) -> SyncOpsRequest {
    SyncOpsRequest {
        es_id: session.to_string(),
        member_id: member.to_string(),
        seq_head: seq_head.clone(),
        client_ops: ops
            .into_iter()
            .map(|op| serde_json::from_value(op).unwrap())
            .collect(),
    }
}

fn insert(member: &str, position: usize, text: &str) -> Value {
    json!({
        "optype": "InsertText",
        "memberid": member,
        "timestamp": 1706745600000u64,
        "position": position,
        "text": text,
    })
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health() {
    let server = TestServer::start().await;

    let body: Value = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["sessions"], 0);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_join_and_list() {
    let server = TestServer::start().await;
    let alice = server.join("doc", "alice").await;
    let bob = server.join("doc", "bob").await;

    let sessions: Vec<SessionInfo> = server
        .client
        .get(server.url("/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].title, "Meeting #1");
    assert!(sessions[0].members.contains(&alice));
    assert!(sessions[0].members.contains(&bob));
}

#[tokio::test]
async fn test_leave_unknown_session() {
    let server = TestServer::start().await;

    let response = server
        .client
        .post(server.url("/sessions/missing/leave"))
        .json(&json!({ "member_id": "alice_1234" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SESSION_NOT_FOUND");
}

// ============================================================================
// sync_ops
// ============================================================================

#[tokio::test]
async fn test_sync_round_trip() {
    let server = TestServer::start().await;
    let alice = server.join("doc", "alice").await;
    let bob = server.join("doc", "bob").await;

    // Initial polls bring everyone up to date.
    let head_a = server
        .sync_ok(&request("doc", &alice, &SeqToken::default(), vec![]))
        .await
        .head_seq;
    let head_b = server
        .sync_ok(&request("doc", &bob, &SeqToken::default(), vec![]))
        .await
        .head_seq;
    assert_eq!(head_a, head_b);

    let reply = server
        .sync_ok(&request("doc", &alice, &head_a, vec![insert(&alice, 0, "hello")]))
        .await;
    assert_eq!(reply.result, SyncResult::Added);
    assert!(reply.ops.is_empty());

    // Bob's upload is based on a stale token.
    let reply = server
        .sync_ok(&request("doc", &bob, &head_b, vec![insert(&bob, 0, "world")]))
        .await;
    assert_eq!(reply.result, SyncResult::Conflict);
    assert_eq!(reply.ops.len(), 1);
    assert_eq!(reply.ops[0].get_str("text"), Some("hello"));
}

#[tokio::test]
async fn test_sync_unknown_session_and_member() {
    let server = TestServer::start().await;
    server.join("doc", "alice").await;

    let reply = server
        .sync_ok(&request("missing", "alice", &SeqToken::default(), vec![]))
        .await;
    assert_eq!(reply.result, SyncResult::Error);
    assert_eq!(reply.error.as_deref(), Some("ENOSESSION"));

    let reply = server
        .sync_ok(&request("doc", "stranger", &SeqToken::default(), vec![]))
        .await;
    assert_eq!(reply.error.as_deref(), Some("ENOMEMBER"));
}

#[tokio::test]
async fn test_sync_session_mismatch() {
    let server = TestServer::start().await;
    let alice = server.join("doc", "alice").await;

    let response = server
        .sync("other", &request("doc", &alice, &SeqToken::default(), vec![]))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_concurrent_uploads_with_same_token() {
    let server = TestServer::start().await;
    let mut members = Vec::new();
    for user in ["a", "b", "c", "d"] {
        members.push(server.join("doc", user).await);
    }
    let head = server
        .sync_ok(&request("doc", &members[0], &SeqToken::default(), vec![]))
        .await
        .head_seq;

    let requests: Vec<_> = members
        .iter()
        .map(|member| request("doc", member, &head, vec![insert(member, 0, "x")]))
        .collect();
    let replies = futures::future::join_all(requests.iter().map(|r| server.sync_ok(r))).await;

    let added = replies
        .iter()
        .filter(|reply| reply.result == SyncResult::Added)
        .count();
    assert_eq!(added, 1);
    assert!(replies
        .iter()
        .all(|reply| matches!(reply.result, SyncResult::Added | SyncResult::Conflict)));
}

// ============================================================================
// Maintenance
// ============================================================================

#[tokio::test]
async fn test_pause_and_resume() {
    let server = TestServer::start().await;
    let alice = server.join("doc", "alice").await;

    let status = server
        .client
        .post(server.url("/admin/pause"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, StatusCode::NO_CONTENT);

    let response = server
        .sync("doc", &request("doc", &alice, &SeqToken::default(), vec![]))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");

    server
        .client
        .post(server.url("/admin/resume"))
        .send()
        .await
        .unwrap();
    let reply = server
        .sync_ok(&request("doc", &alice, &SeqToken::default(), vec![]))
        .await;
    assert_eq!(reply.result, SyncResult::NewOps);
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_write_state() {
    let server = TestServer::start().await;
    let alice = server.join("doc", "alice").await;

    let response = server
        .client
        .put(server.url("/sessions/doc/state"))
        .query(&[("member_id", alice.as_str()), ("seq", "jsg1")])
        .body(b"snapshot".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let stored = tokio::fs::read(server.state_dir.join("doc").join("jsg1.odt"))
        .await
        .unwrap();
    assert_eq!(stored, b"snapshot");

    let response = server
        .client
        .put(server.url("/sessions/doc/state"))
        .query(&[("member_id", "stranger"), ("seq", "jsg1")])
        .body(b"snapshot".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
