//! Configuration for the sync client and its local store.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Where and how the local SQLite store is opened.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file; `None` opens a private in-memory database
    pub path: Option<PathBuf>,
    /// Pool size
    pub max_connections: u32,
    /// How long to wait for a pooled connection
    pub acquire_timeout: Duration,
}

impl StoreConfig {
    /// File-backed store.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// In-memory store, for tests. An in-memory database lives in a single
    /// connection, so the pool is capped at one.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Builder-style pool size setter.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the reconciliation service
    pub server_url: String,
    /// Bearer credential issued by the login flow
    pub auth_token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Local store settings
    pub store: StoreConfig,
}

impl ClientConfig {
    /// Configuration with defaults for everything but the server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            auth_token: None,
            timeout: Duration::from_secs(60),
            store: StoreConfig::in_memory(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_url = env::var("VERISYNC_SERVER_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| "http://localhost:8000".to_string());

        let timeout = env::var("VERISYNC_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidTimeout)?;

        let store = match env::var("VERISYNC_DB_PATH") {
            Ok(path) if !path.is_empty() => StoreConfig::new(path),
            _ => return Err(ConfigError::MissingDbPath),
        };

        Ok(Self {
            server_url,
            auth_token: None,
            timeout,
            store,
        })
    }

    /// Builder-style credential setter.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Builder-style timeout setter.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder-style store setter.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("VERISYNC_TIMEOUT_SECS must be a whole number of seconds")]
    InvalidTimeout,

    #[error("VERISYNC_DB_PATH is not set")]
    MissingDbPath,
}
