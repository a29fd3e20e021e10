//! Hosted sessions.
//!
//! Each session is a [`SessionLog`](odfsync_engine::SessionLog) behind its
//! own async mutex; the mutex is the serialization point of every RPC that
//! touches the log.

mod manager;

pub use manager::{SessionManager, SharedLog};
