//! The portable row representation.

use crate::{timestamp, RecordUuid, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

static NULL: Value = Value::Null;

/// A syncable row as it travels between the client and the service.
///
/// Local integer ids never appear here: the owning parent is referenced by
/// uuid, and every field value is already in its canonical wire form
/// (binary as base64 text, timestamps in [`timestamp::WIRE_FORMAT`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Global identity
    pub uuid: RecordUuid,
    /// Time of the last mutation
    #[serde(with = "timestamp::wire")]
    pub last_modified: Timestamp,
    /// Tombstone flag
    #[serde(default)]
    pub is_deleted: bool,
    /// Parent uuid for child tables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RecordUuid>,
    /// Server version the sender has already seen and chosen to override
    #[serde(
        default,
        with = "timestamp::wire_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_last_modified: Option<Timestamp>,
    /// Every declared field of the table, null when absent
    pub fields: BTreeMap<String, Value>,
}

impl SyncRecord {
    /// Create a new live record with no fields.
    pub fn new(uuid: impl Into<RecordUuid>, last_modified: Timestamp) -> Self {
        Self {
            uuid: uuid.into(),
            last_modified,
            is_deleted: false,
            parent: None,
            base_last_modified: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Builder-style parent setter.
    pub fn with_parent(mut self, parent: impl Into<RecordUuid>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Field value, treating absent as null.
    pub fn field(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&NULL)
    }

    /// Check if record is live (not a tombstone).
    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }

    /// Whether two versions carry the same content. `last_modified` and the
    /// conflict base are bookkeeping and do not count.
    pub fn content_eq(&self, other: &SyncRecord) -> bool {
        if self.uuid != other.uuid
            || self.is_deleted != other.is_deleted
            || self.parent != other.parent
        {
            return false;
        }

        self.fields
            .keys()
            .chain(other.fields.keys())
            .all(|name| self.field(name) == other.field(name))
    }

    /// Mark record as deleted (tombstone).
    pub fn mark_deleted(&mut self, at: Timestamp) {
        self.is_deleted = true;
        self.last_modified = at;
    }
}
