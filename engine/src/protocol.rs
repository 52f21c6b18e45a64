//! Wire messages for the single sync endpoint.
//!
//! ```text
//! request   { last_sync_timestamp, changes: { table: [row, ...] } }
//! success   { status: "success", new_sync_timestamp, changes, uuid_map, skipped? }
//! conflict  { status: "conflict", conflicts: [{ table, uuid, client_version, server_version }] }
//! error     { status: "error", message }
//! ```

use crate::{timestamp, RecordUuid, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// One row as a JSON object. Inbound rows stay untyped until decoded against
/// their table's descriptor so that a single bad row cannot fail a request.
pub type WireRecord = Map<String, Value>;

/// Rows per table.
pub type ChangeSet = BTreeMap<TableName, Vec<WireRecord>>;

/// Server-issued identity remaps, duplicate uuid to canonical uuid.
pub type UuidMap = BTreeMap<RecordUuid, RecordUuid>;

/// Fields that never count as a content difference.
const BOOKKEEPING_FIELDS: &[&str] = &["last_modified", "base_last_modified", "is_synced", "id"];

static NULL: Value = Value::Null;

/// Body of a sync request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Watermark from the previous successful cycle; null on first sync
    #[serde(default, with = "timestamp::wire_opt")]
    pub last_sync_timestamp: Option<Timestamp>,
    /// Locally changed rows, per table
    #[serde(default)]
    pub changes: ChangeSet,
}

impl SyncRequest {
    /// Create a request with no changes.
    pub fn new(last_sync_timestamp: Option<Timestamp>) -> Self {
        Self {
            last_sync_timestamp,
            changes: ChangeSet::new(),
        }
    }

    /// Builder-style method to add rows for a table.
    pub fn with_changes(mut self, table: impl Into<TableName>, rows: Vec<WireRecord>) -> Self {
        self.changes.entry(table.into()).or_default().extend(rows);
        self
    }

    /// Whether this request asks for a full bootstrap pull.
    pub fn is_bootstrap(&self) -> bool {
        self.last_sync_timestamp.is_none()
    }

    /// Total number of rows across tables.
    pub fn row_count(&self) -> usize {
        self.changes.values().map(Vec::len).sum()
    }
}

/// Body of a sync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncResponse {
    /// The whole push was committed.
    Success {
        #[serde(with = "timestamp::wire")]
        new_sync_timestamp: Timestamp,
        #[serde(default)]
        changes: ChangeSet,
        #[serde(default)]
        uuid_map: UuidMap,
        /// Pushed rows left out of the batch; the client keeps them pending
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        skipped: Vec<SkippedChange>,
    },
    /// Nothing was committed.
    Conflict { conflicts: Vec<ConflictEntry> },
    /// The request could not be processed.
    Error { message: String },
}

impl SyncResponse {
    /// Build an error response.
    pub fn error(message: impl Into<String>) -> Self {
        SyncResponse::Error {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncResponse::Success { .. })
    }
}

/// A pushed row the server did not write, such as a child whose parent it
/// has not seen yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedChange {
    pub table: TableName,
    pub uuid: RecordUuid,
    pub reason: String,
}

/// A row the client changed that the server also changed after the
/// client's watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub table: TableName,
    pub uuid: RecordUuid,
    pub client_version: WireRecord,
    pub server_version: WireRecord,
}

impl ConflictEntry {
    /// Fields whose values differ between the two versions, sorted.
    pub fn differing_fields(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .client_version
            .keys()
            .chain(self.server_version.keys())
            .collect();

        names
            .into_iter()
            .filter(|name| !BOOKKEEPING_FIELDS.contains(&name.as_str()))
            .filter(|name| {
                let client = self.client_version.get(*name).unwrap_or(&NULL);
                let server = self.server_version.get(*name).unwrap_or(&NULL);
                client != server
            })
            .cloned()
            .collect()
    }

    /// The server version's `last_modified`, if readable.
    pub fn server_last_modified(&self) -> Option<Timestamp> {
        self.server_version
            .get("last_modified")
            .and_then(Value::as_str)
            .and_then(|text| timestamp::parse(text).ok())
    }
}
