//! Client configuration.

use std::time::Duration;

use odfsync_engine::RouterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Timing of the router's sync rounds.
    pub router: RouterConfig,
    /// Upper bound of one `sync_ops` call; exceeding it counts as a
    /// network failure. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// How long [`SessionClient::close`](crate::SessionClient::close) waits
    /// for the last upload while the host cannot be reached. `None` waits
    /// until it can.
    pub close_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            request_timeout: Some(Duration::from_secs(30)),
            close_timeout: Some(Duration::from_secs(60)),
        }
    }
}
