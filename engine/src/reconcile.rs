//! Server-side apply planning.
//!
//! Given a client's batch and the server's current rows, this module decides
//! what to write, what to skip and whether the batch conflicts. It performs no
//! writes itself, so the same plan drives both the in-memory dataset and the
//! SQL backend.
//!
//! # Algorithm
//!
//! For every table in dependency order (parents first):
//!
//! 1. Decode and normalise each row; rows that cannot be decoded are skipped.
//!    Duplicate uuids within a table collapse to the latest `last_modified`.
//! 2. Rewrite parent references through identity remaps issued earlier in the
//!    same batch, then resolve the parent among the server's rows and the rows
//!    staged by this batch. Unknown parents skip the row.
//! 3. For an existing row: identical content is a no-op (idempotent resend);
//!    otherwise the conflict rule decides between a conflict and an update.
//! 4. For a new row: a tombstone is a no-op; a row matching a duplicate rule
//!    becomes a remap onto the canonical row; everything else is inserted.
//!
//! Every accepted write is stamped with the request's as-of timestamp. If any
//! row conflicts the whole plan is a conflict and nothing may be written.

use crate::{
    codec,
    conflict::is_conflict,
    protocol::{ConflictEntry, SkippedChange, SyncRequest, WireRecord},
    remap::IdentityRemap,
    schema::EntityDescriptor,
    Dataset, RecordUuid, Schema, SyncRecord, TableName, Timestamp,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Decides whether a brand-new row duplicates one the server already has.
pub trait DuplicateRule: Send + Sync {
    /// Table whose new rows this rule inspects.
    fn table(&self) -> &str;

    /// Normalised natural key; rows with equal keys denote the same entity.
    fn key(&self, record: &SyncRecord) -> Option<String>;
}

/// Customers created independently by two clients are the same organisation
/// when name and address match, ignoring case and surrounding whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct CustomerIdentityRule;

impl DuplicateRule for CustomerIdentityRule {
    fn table(&self) -> &str {
        "customers"
    }

    fn key(&self, record: &SyncRecord) -> Option<String> {
        let normalize = |value: &Value| {
            value
                .as_str()
                .map(|text| {
                    text.split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .to_lowercase()
                })
                .unwrap_or_default()
        };

        let name = normalize(record.field("name"));
        if name.is_empty() {
            return None;
        }
        Some(format!("{}\u{1f}{}", name, normalize(record.field("address"))))
    }
}

/// Whether a planned write creates or replaces a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
}

/// A row to write, already stamped with the as-of timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub table: TableName,
    pub kind: WriteKind,
    pub record: SyncRecord,
}

/// Why a row was left out of the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The parent uuid is unknown to the server.
    MissingParent { table: TableName, uuid: RecordUuid },
    /// A live row points at a tombstoned parent.
    DeletedParent { table: TableName, uuid: RecordUuid },
    /// The row could not be decoded.
    Malformed(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingParent { table, uuid } => {
                write!(f, "parent {}/{} not found", table, uuid)
            }
            SkipReason::DeletedParent { table, uuid } => {
                write!(f, "parent {}/{} is deleted", table, uuid)
            }
            SkipReason::Malformed(reason) => write!(f, "malformed row: {}", reason),
        }
    }
}

/// A row that was skipped without failing the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub table: TableName,
    pub uuid: Option<RecordUuid>,
    pub reason: SkipReason,
}

/// Fields discarded while normalising a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNotice {
    pub table: TableName,
    pub uuid: RecordUuid,
    pub dropped: Vec<String>,
    pub nulled: Vec<String>,
}

/// Everything a backend needs to commit a conflict-free batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyPlan {
    /// Timestamp stamped on every write and used as the new watermark
    pub as_of: Timestamp,
    /// Writes in dependency order
    pub writes: Vec<PlannedWrite>,
    /// Rows that needed no write (resends, unknown tombstones)
    pub unchanged: Vec<(TableName, RecordUuid)>,
    /// Rows left out of the batch
    pub skipped: Vec<SkippedRow>,
    /// Normalisation notices
    pub notices: Vec<FieldNotice>,
    /// Identity remaps decided for this batch
    pub remaps: IdentityRemap,
    /// Existing canonical rows that must reach the client with the remap
    pub canonical_rows: Vec<(TableName, RecordUuid)>,
    /// Tables in the request that the schema does not know
    pub ignored_tables: Vec<TableName>,
}

impl ApplyPlan {
    fn new(as_of: Timestamp) -> Self {
        Self {
            as_of,
            writes: Vec::new(),
            unchanged: Vec::new(),
            skipped: Vec::new(),
            notices: Vec::new(),
            remaps: IdentityRemap::new(),
            canonical_rows: Vec::new(),
            ignored_tables: Vec::new(),
        }
    }

    pub fn insert_count(&self) -> usize {
        self.writes
            .iter()
            .filter(|w| w.kind == WriteKind::Insert)
            .count()
    }

    pub fn update_count(&self) -> usize {
        self.writes
            .iter()
            .filter(|w| w.kind == WriteKind::Update)
            .count()
    }

    /// Skipped rows the client can identify, for the success response.
    pub fn skipped_changes(&self) -> Vec<SkippedChange> {
        self.skipped
            .iter()
            .filter_map(|row| {
                row.uuid.as_ref().map(|uuid| SkippedChange {
                    table: row.table.clone(),
                    uuid: uuid.clone(),
                    reason: row.reason.to_string(),
                })
            })
            .collect()
    }
}

/// Outcome of planning a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Apply(ApplyPlan),
    Conflict(Vec<ConflictEntry>),
}

/// The reconciler plans a client's batch against the server's rows.
pub struct Reconciler<'a> {
    schema: &'a Schema,
    rules: Vec<&'a dyn DuplicateRule>,
}

impl<'a> Reconciler<'a> {
    /// Create a new reconciler with no duplicate rules.
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            rules: Vec::new(),
        }
    }

    /// Builder-style method to add a duplicate rule.
    pub fn with_duplicate_rule(mut self, rule: &'a dyn DuplicateRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Plan `request` against `current`, answering as of `as_of`.
    pub fn plan(&self, request: &SyncRequest, current: &Dataset, as_of: Timestamp) -> Plan {
        let watermark = request.last_sync_timestamp;
        let mut plan = ApplyPlan::new(as_of);
        let mut conflicts = Vec::new();
        // (table, uuid) -> is_deleted for rows this batch writes or confirms
        let mut staged: HashMap<(TableName, RecordUuid), bool> = HashMap::new();

        plan.ignored_tables = request
            .changes
            .keys()
            .filter(|table| self.schema.entity(table).is_none())
            .cloned()
            .collect();

        for entity in self.schema.entities() {
            let Some(rows) = request.changes.get(&entity.name) else {
                continue;
            };
            let rule = self
                .rules
                .iter()
                .copied()
                .find(|rule| rule.table() == entity.name);

            for mut record in decode_batch(entity, rows, &mut plan) {
                if let Some(parent) = record.parent.as_mut() {
                    if let Some(canonical) = plan.remaps.resolve(parent) {
                        *parent = canonical.clone();
                    }
                }

                if let Some(reason) = check_parent(entity, &record, current, &staged) {
                    plan.skipped.push(SkippedRow {
                        table: entity.name.clone(),
                        uuid: Some(record.uuid.clone()),
                        reason,
                    });
                    continue;
                }

                let key = (entity.name.clone(), record.uuid.clone());
                match current.get(&entity.name, &record.uuid) {
                    Some(server) if server.content_eq(&record) => {
                        staged.insert(key.clone(), server.is_deleted);
                        plan.unchanged.push(key);
                    }
                    Some(server)
                        if is_conflict(
                            server.last_modified,
                            watermark,
                            record.base_last_modified,
                        ) =>
                    {
                        conflicts.push(ConflictEntry {
                            table: entity.name.clone(),
                            uuid: record.uuid.clone(),
                            client_version: codec::encode_record(entity, &record),
                            server_version: codec::encode_record(entity, server),
                        });
                    }
                    Some(_) => {
                        staged.insert(key, record.is_deleted);
                        plan.writes
                            .push(stamp(entity, WriteKind::Update, record, as_of));
                    }
                    None if record.is_deleted => plan.unchanged.push(key),
                    None => {
                        let canonical = rule.and_then(|rule| {
                            find_duplicate(rule, &entity.name, &record, current, &plan)
                        });
                        match canonical {
                            Some((canonical, existing)) => {
                                plan.remaps.insert(record.uuid.clone(), canonical.clone());
                                if existing {
                                    plan.canonical_rows.push((entity.name.clone(), canonical));
                                }
                            }
                            None => {
                                staged.insert(key, false);
                                plan.writes
                                    .push(stamp(entity, WriteKind::Insert, record, as_of));
                            }
                        }
                    }
                }
            }
        }

        if conflicts.is_empty() {
            Plan::Apply(plan)
        } else {
            Plan::Conflict(conflicts)
        }
    }
}

/// Decode a table's rows, recording notices and malformed rows, and collapse
/// repeated uuids to the latest version. First-seen order is kept.
fn decode_batch(
    entity: &EntityDescriptor,
    rows: &[WireRecord],
    plan: &mut ApplyPlan,
) -> Vec<SyncRecord> {
    let mut order = Vec::new();
    let mut latest: HashMap<RecordUuid, SyncRecord> = HashMap::new();

    for raw in rows {
        match codec::decode_record(entity, raw.clone()) {
            Ok(decoded) => {
                let record = decoded.record;
                if !decoded.dropped_fields.is_empty() || !decoded.nulled_fields.is_empty() {
                    plan.notices.push(FieldNotice {
                        table: entity.name.clone(),
                        uuid: record.uuid.clone(),
                        dropped: decoded.dropped_fields,
                        nulled: decoded.nulled_fields,
                    });
                }
                match latest.get(&record.uuid) {
                    Some(previous) if previous.last_modified > record.last_modified => {}
                    Some(_) => {
                        latest.insert(record.uuid.clone(), record);
                    }
                    None => {
                        order.push(record.uuid.clone());
                        latest.insert(record.uuid.clone(), record);
                    }
                }
            }
            Err(err) => plan.skipped.push(SkippedRow {
                table: entity.name.clone(),
                uuid: raw.get("uuid").and_then(Value::as_str).map(str::to_string),
                reason: SkipReason::Malformed(err.to_string()),
            }),
        }
    }

    order
        .into_iter()
        .filter_map(|uuid| latest.remove(&uuid))
        .collect()
}

/// A live child needs a live parent; a tombstone only needs the parent to
/// exist, so cascaded deletions still propagate.
fn check_parent(
    entity: &EntityDescriptor,
    record: &SyncRecord,
    current: &Dataset,
    staged: &HashMap<(TableName, RecordUuid), bool>,
) -> Option<SkipReason> {
    let parent_ref = entity.parent.as_ref()?;
    let parent_uuid = record.parent.as_ref()?;

    let parent_deleted = staged
        .get(&(parent_ref.table.clone(), parent_uuid.clone()))
        .copied()
        .or_else(|| {
            current
                .get(&parent_ref.table, parent_uuid)
                .map(|row| row.is_deleted)
        });

    match parent_deleted {
        None => Some(SkipReason::MissingParent {
            table: parent_ref.table.clone(),
            uuid: parent_uuid.clone(),
        }),
        Some(true) if !record.is_deleted => Some(SkipReason::DeletedParent {
            table: parent_ref.table.clone(),
            uuid: parent_uuid.clone(),
        }),
        Some(_) => None,
    }
}

/// Find a row the new `record` duplicates: first among live server rows, then
/// among rows this batch inserts. Returns the canonical uuid and whether it
/// already existed server-side.
fn find_duplicate(
    rule: &dyn DuplicateRule,
    table: &str,
    record: &SyncRecord,
    current: &Dataset,
    plan: &ApplyPlan,
) -> Option<(RecordUuid, bool)> {
    let key = rule.key(record)?;

    if let Some(existing) = current
        .rows(table)
        .filter(|row| row.is_active())
        .find(|row| rule.key(row).as_deref() == Some(key.as_str()))
    {
        return Some((existing.uuid.clone(), true));
    }

    let inserted: HashSet<&str> = plan
        .writes
        .iter()
        .filter(|w| w.table == table && w.kind == WriteKind::Insert)
        .filter(|w| rule.key(&w.record).as_deref() == Some(key.as_str()))
        .map(|w| w.record.uuid.as_str())
        .collect();
    inserted
        .into_iter()
        .min()
        .map(|uuid| (uuid.to_string(), false))
}

fn stamp(
    entity: &EntityDescriptor,
    kind: WriteKind,
    mut record: SyncRecord,
    as_of: Timestamp,
) -> PlannedWrite {
    record.last_modified = as_of;
    record.base_last_modified = None;
    PlannedWrite {
        table: entity.name.clone(),
        kind,
        record,
    }
}
