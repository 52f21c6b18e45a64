//! Error types for the verisync engine.

use crate::TableName;
use thiserror::Error;

/// All possible errors from the verisync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("unknown table: {0}")]
    UnknownTable(TableName),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    // Record errors
    #[error("record has no uuid")]
    MissingUuid,

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("missing parent reference: {0}")]
    MissingParentRef(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Identity errors
    #[error("invalid identity remap: {0}")]
    InvalidRemap(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
