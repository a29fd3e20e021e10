//! Configuration management for the server.

use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Directory receiving document snapshots
    pub state_dir: PathBuf,
    /// Prefix of generated session titles
    pub session_title_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            state_dir: PathBuf::from("./session-state"),
            session_title_prefix: "Session".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);

        let port = match env::var("PORT") {
            Ok(port) => port.parse().map_err(|_| ConfigError::InvalidPort(port))?,
            Err(_) => defaults.port,
        };

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);

        let session_title_prefix =
            env::var("SESSION_TITLE_PREFIX").unwrap_or(defaults.session_title_prefix);

        Ok(Self {
            host,
            port,
            state_dir,
            session_title_prefix,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value: {0}")]
    InvalidPort(String),
}
