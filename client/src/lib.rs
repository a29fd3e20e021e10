//! # ODF Sync Client
//!
//! Runs an [`OperationRouter`](odfsync_engine::OperationRouter) against a
//! session host. The router stays sans-IO; [`SessionClient`] spawns a
//! driver task that performs the `sync_ops` calls, fires its timers and
//! plays remote operations back in slices, yielding between them.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use odfsync_client::{ClientConfig, HttpTransport, SessionClient, SharedDocument};
//! use odfsync_engine::textops::{self, TextDocument, TextOperation, TextOperationFactory};
//!
//! # async fn demo() -> odfsync_client::Result<()> {
//! let document = SharedDocument::new(TextDocument::default());
//! let client = SessionClient::join(
//!     Arc::new(HttpTransport::new("http://localhost:3000")),
//!     "doc",
//!     "alice",
//!     TextOperationFactory,
//!     document.clone(),
//!     textops::transformer(),
//!     ClientConfig::default(),
//! )
//! .await?;
//!
//! let member = client.member_id().to_string();
//! client.push(vec![TextOperation::insert_text(member, 0, "hello")]).await?;
//! client.sync().await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod document;
pub mod driver;
pub mod error;
pub mod transport;

pub use config::ClientConfig;
pub use document::{SharedDocument, SnapshotSource};
pub use driver::{ClientEvent, SessionClient, SessionDriver};
pub use error::{ClientError, Result, TransportError};
pub use transport::{HttpTransport, SessionTransport};
