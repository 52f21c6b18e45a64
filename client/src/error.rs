//! Error types for the sync client.

use verisync_engine::{RecordUuid, TableName};

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    // Network
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    // Local store
    #[error("local store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("engine error: {0}")]
    Engine(#[from] verisync_engine::Error),

    // Orchestration
    #[error("a sync cycle is already in progress")]
    SyncInProgress,

    #[error("unknown table: {0}")]
    UnknownTable(TableName),

    #[error("no row {uuid} in {table}")]
    UnknownRecord { table: TableName, uuid: RecordUuid },

    #[error("parent {uuid} of {table} row is not in the local store")]
    UnknownParent { table: TableName, uuid: RecordUuid },
}

impl ClientError {
    /// Whether the next cycle may simply retry with the same batch.
    ///
    /// Auth failures need a new credential first; local store and data
    /// errors will not go away on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Server(_) | ClientError::SyncInProgress
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::InvalidResponse(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
