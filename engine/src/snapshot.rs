//! Snapshot types for persisting and restoring a dataset.
//!
//! Snapshots let the in-memory backend survive restarts. Maps are ordered so
//! that the same state always serializes to the same bytes.

use crate::{
    error::Result, timestamp::ServerClock, Error, RecordUuid, Schema, SchemaVersion, SyncRecord,
    TableName,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// Last as-of timestamp issued
    pub clock: ServerClock,
    /// All rows organized by table, then by uuid
    pub tables: BTreeMap<TableName, BTreeMap<RecordUuid, SyncRecord>>,
}

impl DatasetSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            clock: ServerClock::new(),
            tables: BTreeMap::new(),
        }
    }

    /// Count total rows across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Check the snapshot was written for `schema`.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.schema_version != schema.version {
            return Err(Error::InvalidSnapshot(format!(
                "schema version mismatch: expected {}, got {}",
                schema.version, self.schema_version
            )));
        }

        for table in self.tables.keys() {
            schema.require(table)?;
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
