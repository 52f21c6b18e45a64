//! The authoritative row set.
//!
//! A [`Dataset`] holds every row the reconciliation service knows, tombstones
//! included, together with the clock that issues as-of timestamps. It is the
//! in-memory backend of the service and the scratch view the SQL backend
//! hydrates for planning.

use crate::{
    codec,
    protocol::ChangeSet,
    reconcile::ApplyPlan,
    snapshot::DatasetSnapshot,
    timestamp::{PullWindow, ServerClock},
    RecordUuid, Schema, SchemaVersion, SyncRecord, TableName, Timestamp,
};
use std::collections::BTreeMap;

/// Rows per table, keyed by uuid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    tables: BTreeMap<TableName, BTreeMap<RecordUuid, SyncRecord>>,
    clock: ServerClock,
}

impl Dataset {
    /// Create an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a row by table and uuid, tombstones included.
    pub fn get(&self, table: &str, uuid: &str) -> Option<&SyncRecord> {
        self.tables.get(table)?.get(uuid)
    }

    /// Iterate all rows of a table in uuid order.
    pub fn rows<'a>(&'a self, table: &str) -> impl Iterator<Item = &'a SyncRecord> + 'a {
        self.tables.get(table).into_iter().flat_map(|rows| rows.values())
    }

    /// Insert or replace a row.
    pub fn put(&mut self, table: impl Into<TableName>, record: SyncRecord) {
        self.tables
            .entry(table.into())
            .or_default()
            .insert(record.uuid.clone(), record);
    }

    /// Count total rows across tables.
    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count live rows across tables.
    pub fn active_len(&self) -> usize {
        self.tables
            .values()
            .flat_map(BTreeMap::values)
            .filter(|r| r.is_active())
            .count()
    }

    pub fn clock(&self) -> ServerClock {
        self.clock
    }

    /// Issue the as-of timestamp for the next request.
    pub fn issue_as_of(&mut self, wall: Timestamp) -> Timestamp {
        self.clock.issue(wall)
    }

    /// Commit every write of a conflict-free plan.
    pub fn apply(&mut self, plan: &ApplyPlan) {
        for write in &plan.writes {
            self.put(write.table.clone(), write.record.clone());
        }
    }

    /// Rows in `window`, per table, ordered by `last_modified` then uuid.
    /// Tables with nothing to send are omitted.
    pub fn pull(&self, schema: &Schema, window: PullWindow) -> ChangeSet {
        let mut changes = ChangeSet::new();

        for entity in schema.entities() {
            let mut rows: Vec<&SyncRecord> = self
                .rows(&entity.name)
                .filter(|r| window.includes(r.last_modified, r.is_deleted))
                .collect();
            if rows.is_empty() {
                continue;
            }
            rows.sort_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.uuid.cmp(&b.uuid))
            });
            changes.insert(
                entity.name.clone(),
                rows.into_iter()
                    .map(|r| codec::encode_record(entity, r))
                    .collect(),
            );
        }

        changes
    }

    /// Export the full state.
    pub fn snapshot(&self, schema_version: SchemaVersion) -> DatasetSnapshot {
        DatasetSnapshot {
            clock: self.clock,
            tables: self.tables.clone(),
            ..DatasetSnapshot::new(schema_version)
        }
    }

    /// Restore from an exported state.
    pub fn from_snapshot(snapshot: DatasetSnapshot) -> Self {
        Self {
            tables: snapshot.tables,
            clock: snapshot.clock,
        }
    }
}
