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
    /// PostgreSQL connection URL; without one the in-memory backend is used
    pub database_url: Option<String>,
    /// HS256 secret for bearer tokens; without one requests may be anonymous
    pub auth_secret: Option<String>,
    /// PostgreSQL pool size
    pub max_connections: u32,
    /// Where the in-memory backend keeps its snapshot
    pub snapshot_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());

        let max_connections = env::var("MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidMaxConnections)?;

        let snapshot_path = env::var("SNAPSHOT_PATH").ok().map(PathBuf::from);

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            max_connections,
            snapshot_path,
        })
    }

    /// Development configuration: in-memory, no auth.
    pub fn in_memory() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: None,
            auth_secret: None,
            max_connections: 1,
            snapshot_path: None,
        }
    }

    /// Builder-style method to require bearer tokens.
    pub fn with_auth_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth_secret = Some(secret.into());
        self
    }

    /// Builder-style method to persist the in-memory backend.
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid MAX_CONNECTIONS value")]
    InvalidMaxConnections,
}
