//! Session RPC transports.
//!
//! The driver talks to the session host only through [`SessionTransport`].
//! [`HttpTransport`] speaks the server's HTTP routes.

use std::future::Future;

use odfsync_engine::{
    JoinSessionRequest, JoinSessionResponse, LeaveSessionRequest, MemberId, SeqToken,
    SyncOpsRequest, SyncOpsResponse,
};

use crate::error::TransportError;

/// The RPCs a member issues against its session host.
pub trait SessionTransport: Send + Sync + 'static {
    /// Join a session as `user_id`, returning the new member id.
    fn join_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<MemberId, TransportError>> + Send;

    fn leave_session(
        &self,
        session_id: &str,
        member_id: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// One synchronization round.
    fn sync_ops(
        &self,
        request: SyncOpsRequest,
    ) -> impl Future<Output = Result<SyncOpsResponse, TransportError>> + Send;

    /// Upload a snapshot of the document at log state `seq`.
    fn write_session_state(
        &self,
        session_id: &str,
        member_id: &str,
        seq: &SeqToken,
        document: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Transport over the session server's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, session_id: &str, rpc: &str) -> String {
        format!("{}/sessions/{session_id}/{rpc}", self.base_url)
    }
}

/// Turn non-success statuses into errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::debug!(status = status.as_u16(), %body, "session host returned an error");
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

impl SessionTransport for HttpTransport {
    async fn join_session(&self, session_id: &str, user_id: &str) -> Result<MemberId, TransportError> {
        let response = self
            .client
            .post(self.session_url(session_id, "join"))
            .json(&JoinSessionRequest {
                user_id: user_id.to_string(),
            })
            .send()
            .await?;
        let joined: JoinSessionResponse = check_status(response).await?.json().await?;
        Ok(joined.member_id)
    }

    async fn leave_session(&self, session_id: &str, member_id: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.session_url(session_id, "leave"))
            .json(&LeaveSessionRequest {
                member_id: member_id.to_string(),
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn sync_ops(&self, request: SyncOpsRequest) -> Result<SyncOpsResponse, TransportError> {
        let response = self
            .client
            .post(self.session_url(&request.es_id, "sync_ops"))
            .json(&request)
            .send()
            .await?;
        let reply = check_status(response).await?.json().await?;
        Ok(reply)
    }

    async fn write_session_state(
        &self,
        session_id: &str,
        member_id: &str,
        seq: &SeqToken,
        document: Vec<u8>,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .put(self.session_url(session_id, "state"))
            .query(&[("member_id", member_id), ("seq", seq.as_str())])
            .body(document)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
