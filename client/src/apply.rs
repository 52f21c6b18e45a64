//! Applying a successful sync response to the local store.
//!
//! Everything happens in one transaction: the wipe of a full reset, identity
//! remaps, acknowledgement of the outbound batch, the inbound upserts and the
//! watermark advance. Any failure rolls the store back to where the cycle
//! started.

use std::collections::BTreeMap;

use sqlx::SqliteConnection;
use tracing::{debug, info, warn};
use verisync_engine::{
    decode_record, ChangeSet, EntityDescriptor, IdentityRemap, Schema, SkippedChange, SyncRecord,
    TableName, Timestamp, UuidMap,
};

use crate::collector::Outbound;
use crate::error::Result;
use crate::store::{rows, LocalStore};

/// What a successful cycle did to the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSummary {
    /// Watermark after the cycle
    pub watermark: Timestamp,
    /// Rows sent
    pub pushed: usize,
    /// Sent rows marked synced; the rest were edited while in flight
    pub acknowledged: usize,
    /// Sent rows the server left out; they stay pending
    pub rejected: usize,
    /// Inbound rows written, per table
    pub applied: BTreeMap<TableName, usize>,
    /// Inbound rows rejected (unresolved parent, malformed)
    pub skipped: usize,
    /// Inbound rows left alone because of a pending local edit
    pub deferred: usize,
    /// Identity remaps that matched a local row
    pub remapped: usize,
}

impl SyncSummary {
    pub fn applied_total(&self) -> usize {
        self.applied.values().sum()
    }
}

/// Outcome of writing one inbound row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upsert {
    Applied,
    Deferred,
    Skipped,
    Ignored,
}

/// The server's answer to a successful cycle.
#[derive(Debug, Clone, Copy)]
pub struct Inbound<'a> {
    pub new_sync_timestamp: Timestamp,
    pub changes: &'a ChangeSet,
    pub uuid_map: &'a UuidMap,
    pub skipped: &'a [SkippedChange],
}

/// Apply a success response for `outbound`.
pub async fn apply_success(
    store: &LocalStore,
    outbound: &Outbound,
    response: Inbound<'_>,
) -> Result<SyncSummary> {
    let schema = store.schema();
    let remap = IdentityRemap::from_map(response.uuid_map)?;
    let mut summary = SyncSummary {
        watermark: response.new_sync_timestamp,
        pushed: outbound.len(),
        acknowledged: 0,
        rejected: 0,
        applied: BTreeMap::new(),
        skipped: 0,
        deferred: 0,
        remapped: 0,
    };

    let mut tx = store.pool().begin().await?;

    if outbound.reset {
        rows::wipe(&mut tx, schema).await?;
        warn!("Local store replaced by the server dataset");
    }

    for (duplicate, canonical) in remap.iter() {
        if apply_remap(&mut tx, schema, duplicate, canonical).await? {
            summary.remapped += 1;
        }
    }

    for rejected in response.skipped {
        warn!(
            table = %rejected.table,
            uuid = %rejected.uuid,
            reason = %rejected.reason,
            "Server skipped pushed row; it stays pending"
        );
    }

    // Acknowledge before applying inbound rows, so the server's copy of what
    // we just pushed replaces ours.
    for sent in &outbound.sent {
        let uuid = remap.apply(&sent.uuid);
        let was_skipped = response
            .skipped
            .iter()
            .any(|row| row.table == sent.table && (row.uuid == sent.uuid || row.uuid == uuid));
        if was_skipped {
            summary.rejected += 1;
            continue;
        }
        if rows::mark_synced(&mut tx, &sent.table, uuid, sent.last_modified).await? {
            summary.acknowledged += 1;
        }
    }

    let inbound = response.changes;
    for table in inbound.keys() {
        if schema.entity(table).is_none() {
            warn!(table = %table, "Ignoring inbound rows for unknown table");
        }
    }

    for entity in schema.entities() {
        let Some(wire_rows) = inbound.get(&entity.name) else {
            continue;
        };

        let mut applied = 0;
        for raw in wire_rows {
            let record = match decode_record(entity, raw.clone()) {
                Ok(decoded) => decoded.record,
                Err(err) => {
                    warn!(table = %entity.name, error = %err, "Skipping malformed inbound row");
                    summary.skipped += 1;
                    continue;
                }
            };

            let uuid = record.uuid.clone();
            let server_version = record.last_modified;
            match upsert_inbound(&mut tx, entity, record).await? {
                Upsert::Applied => applied += 1,
                Upsert::Deferred => {
                    summary.deferred += 1;
                    pin_deferred(&mut tx, outbound, &remap, &entity.name, &uuid, server_version)
                        .await?;
                }
                Upsert::Skipped => summary.skipped += 1,
                Upsert::Ignored => {}
            }
        }

        if applied > 0 {
            summary.applied.insert(entity.name.clone(), applied);
        }
    }

    summary.watermark = rows::advance_watermark(&mut tx, response.new_sync_timestamp).await?;
    tx.commit().await?;

    for (table, count) in &summary.applied {
        info!(table = %table, rows = count, "Applied server changes");
    }
    info!(
        pushed = summary.pushed,
        acknowledged = summary.acknowledged,
        rejected = summary.rejected,
        skipped = summary.skipped,
        deferred = summary.deferred,
        watermark = %verisync_engine::timestamp::format(&summary.watermark),
        "Sync applied"
    );

    Ok(summary)
}

/// A server version arrived for a row edited locally while the cycle was in
/// flight. Pin the version the edit is based on, so the next push is judged
/// against it rather than against the advanced watermark.
///
/// If the row went out in this batch, the server's copy is our own push and
/// the edit supersedes it. Otherwise the server version came from elsewhere
/// and the edit is based on whatever this device had seen before the cycle.
async fn pin_deferred(
    conn: &mut SqliteConnection,
    outbound: &Outbound,
    remap: &IdentityRemap,
    table: &str,
    uuid: &str,
    server_version: Timestamp,
) -> Result<()> {
    let own_push = outbound
        .sent
        .iter()
        .any(|sent| sent.table == table && remap.apply(&sent.uuid) == uuid);

    if own_push {
        rows::pin_base(conn, table, uuid, server_version, true).await
    } else {
        let seen = outbound.watermark.unwrap_or(Timestamp::UNIX_EPOCH);
        debug!(table = %table, uuid = %uuid, "Concurrent server edit; next push will conflict");
        rows::pin_base(conn, table, uuid, seen, false).await
    }
}

/// Rewrite `duplicate` to `canonical` in whichever table holds it.
///
/// With the canonical row present, children move under it and the duplicate
/// row is removed; otherwise the duplicate simply takes the canonical uuid.
pub(crate) async fn apply_remap(
    conn: &mut SqliteConnection,
    schema: &Schema,
    duplicate: &str,
    canonical: &str,
) -> Result<bool> {
    for entity in schema.entities() {
        let Some(dup_row) = rows::lookup(conn, &entity.name, duplicate).await? else {
            continue;
        };

        match rows::lookup(conn, &entity.name, canonical).await? {
            Some(canonical_row) => {
                let mut moved = 0;
                for child in schema.children_of(&entity.name) {
                    moved += rows::repoint_children(conn, child, dup_row.id, canonical_row.id)
                        .await?;
                }
                rows::delete_row(conn, &entity.name, dup_row.id).await?;
                warn!(
                    table = %entity.name,
                    duplicate = %duplicate,
                    canonical = %canonical,
                    children = moved,
                    "Merged duplicate row into canonical"
                );
            }
            None => {
                rows::rename_uuid(conn, &entity.name, duplicate, canonical).await?;
                warn!(
                    table = %entity.name,
                    duplicate = %duplicate,
                    canonical = %canonical,
                    "Renamed duplicate row to canonical uuid"
                );
            }
        }
        return Ok(true);
    }

    debug!(duplicate = %duplicate, "Remap matches no local row");
    Ok(false)
}

/// Write a server version over the local row, keyed by uuid.
pub(crate) async fn upsert_inbound(
    conn: &mut SqliteConnection,
    entity: &EntityDescriptor,
    mut record: SyncRecord,
) -> Result<Upsert> {
    let existing = rows::lookup(conn, &entity.name, &record.uuid).await?;
    match existing {
        Some(local) if !local.is_synced => {
            debug!(table = %entity.name, uuid = %record.uuid, "Keeping pending local edit");
            return Ok(Upsert::Deferred);
        }
        None if record.is_deleted => return Ok(Upsert::Ignored),
        _ => {}
    }

    let parent_id = match (&entity.parent, &record.parent) {
        (Some(parent_ref), Some(parent_uuid)) => {
            match rows::lookup(conn, &parent_ref.table, parent_uuid).await? {
                Some(parent) if !parent.is_deleted || record.is_deleted => Some(parent.id),
                _ => {
                    warn!(
                        table = %entity.name,
                        uuid = %record.uuid,
                        parent_table = %parent_ref.table,
                        parent_uuid = %parent_uuid,
                        "Skipping row with unresolved parent"
                    );
                    return Ok(Upsert::Skipped);
                }
            }
        }
        _ => None,
    };

    record.base_last_modified = None;
    rows::write_row(conn, entity, &record, parent_id, true).await?;
    Ok(Upsert::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector;
    use serde_json::json;
    use verisync_engine::{timestamp, WireRecord};

    fn wire(value: serde_json::Value) -> WireRecord {
        value.as_object().unwrap().clone()
    }

    fn ts(text: &str) -> Timestamp {
        timestamp::parse(text).unwrap()
    }

    fn response<'a>(at: &str, changes: &'a ChangeSet, uuid_map: &'a UuidMap) -> Inbound<'a> {
        Inbound {
            new_sync_timestamp: ts(at),
            changes,
            uuid_map,
            skipped: &[],
        }
    }

    fn changes(table: &str, rows: Vec<WireRecord>) -> ChangeSet {
        let mut set = ChangeSet::new();
        set.insert(table.to_string(), rows);
        set
    }

    #[tokio::test]
    async fn inserts_and_overwrites_by_uuid() {
        let store = LocalStore::in_memory().await.unwrap();
        let inbound = changes(
            "customers",
            vec![wire(json!({"uuid": "c-1", "last_modified": "2024-01-31T10:00:00Z", "name": "ACME"}))],
        );

        let summary = apply_success(
            &store,
            &Outbound::default(),
            response("2024-01-31T10:00:00Z", &inbound, &UuidMap::new()),
        )
        .await
        .unwrap();
        assert_eq!(summary.applied["customers"], 1);

        let inbound = changes(
            "customers",
            vec![wire(json!({"uuid": "c-1", "last_modified": "2024-02-01T10:00:00Z", "name": "ACME Srl"}))],
        );
        apply_success(
            &store,
            &Outbound::default(),
            response("2024-02-01T10:00:00Z", &inbound, &UuidMap::new()),
        )
        .await
        .unwrap();

        let row = store.get("customers", "c-1").await.unwrap().unwrap();
        assert!(row.is_synced);
        assert_eq!(row.record.field("name"), &json!("ACME Srl"));
        assert_eq!(store.list("customers").await.unwrap().len(), 1);
        assert_eq!(store.watermark().await.unwrap(), Some(ts("2024-02-01T10:00:00Z")));
    }

    #[tokio::test]
    async fn unknown_tombstone_is_a_no_op() {
        let store = LocalStore::in_memory().await.unwrap();
        let inbound = changes(
            "customers",
            vec![wire(json!({
                "uuid": "gone", "last_modified": "2024-01-31T10:00:00Z",
                "is_deleted": true, "name": "Old",
            }))],
        );

        let summary = apply_success(
            &store,
            &Outbound::default(),
            response("2024-01-31T10:00:00Z", &inbound, &UuidMap::new()),
        )
        .await
        .unwrap();

        assert_eq!(summary.applied_total(), 0);
        assert!(store.get("customers", "gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphan_is_skipped_not_fatal() {
        let store = LocalStore::in_memory().await.unwrap();
        let mut inbound = changes(
            "customers",
            vec![wire(json!({"uuid": "c-1", "last_modified": "2024-01-31T10:00:00Z", "name": "ACME"}))],
        );
        inbound.insert(
            "destinations".into(),
            vec![wire(json!({
                "uuid": "s-9", "last_modified": "2024-01-31T10:00:00Z",
                "customer_uuid": "nobody", "name": "Lost",
            }))],
        );

        let summary = apply_success(
            &store,
            &Outbound::default(),
            response("2024-01-31T10:00:00Z", &inbound, &UuidMap::new()),
        )
        .await
        .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.applied["customers"], 1);
        assert!(store.get("destinations", "s-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edit_made_while_in_flight_stays_pending() {
        let store = LocalStore::in_memory().await.unwrap();
        store
            .save(
                "customers",
                SyncRecord::new("c-1", timestamp::now()).with_field("name", json!("Sent")),
            )
            .await
            .unwrap();
        let outbound = collector::collect(&store).await.unwrap();

        // The user edits again before the response arrives.
        store
            .save(
                "customers",
                SyncRecord::new("c-1", timestamp::now()).with_field("name", json!("Newer")),
            )
            .await
            .unwrap();

        let echo = changes(
            "customers",
            vec![wire(json!({"uuid": "c-1", "last_modified": "2024-01-31T10:00:00Z", "name": "Sent"}))],
        );
        let summary = apply_success(
            &store,
            &outbound,
            response("2024-01-31T10:00:00Z", &echo, &UuidMap::new()),
        )
        .await
        .unwrap();

        assert_eq!(summary.acknowledged, 0);
        assert_eq!(summary.deferred, 1);
        let row = store.get("customers", "c-1").await.unwrap().unwrap();
        assert!(!row.is_synced);
        assert_eq!(row.record.field("name"), &json!("Newer"));
        // The echo is our own push; the edit supersedes exactly that version.
        assert_eq!(row.record.base_last_modified, Some(ts("2024-01-31T10:00:00Z")));
    }

    #[tokio::test]
    async fn concurrent_server_edit_pins_the_previous_watermark() {
        let store = LocalStore::in_memory().await.unwrap();
        let seen = ts("2024-01-10T00:00:00Z");
        let synced = changes(
            "customers",
            vec![wire(json!({"uuid": "c-1", "last_modified": "2024-01-05T00:00:00Z", "name": "ACME"}))],
        );
        apply_success(
            &store,
            &Outbound::default(),
            response("2024-01-10T00:00:00Z", &synced, &UuidMap::new()),
        )
        .await
        .unwrap();

        // Nothing pending goes out; the user edits while the request travels.
        let outbound = collector::collect(&store).await.unwrap();
        assert_eq!(outbound.watermark, Some(seen));
        store
            .save(
                "customers",
                SyncRecord::new("c-1", timestamp::now()).with_field("name", json!("Edit A")),
            )
            .await
            .unwrap();

        let foreign = changes(
            "customers",
            vec![wire(json!({"uuid": "c-1", "last_modified": "2024-01-20T00:00:00Z", "name": "Edit B"}))],
        );
        let summary = apply_success(
            &store,
            &outbound,
            response("2024-01-20T00:00:00Z", &foreign, &UuidMap::new()),
        )
        .await
        .unwrap();

        assert_eq!(summary.deferred, 1);
        assert_eq!(store.watermark().await.unwrap(), Some(ts("2024-01-20T00:00:00Z")));
        let row = store.get("customers", "c-1").await.unwrap().unwrap();
        assert_eq!(row.record.field("name"), &json!("Edit A"));
        assert_eq!(row.record.base_last_modified, Some(seen));

        let next = collector::collect(&store).await.unwrap();
        assert_eq!(
            next.changes["customers"][0]["base_last_modified"],
            json!("2024-01-10T00:00:00.000000Z")
        );
    }

    #[tokio::test]
    async fn rows_the_server_skipped_stay_pending() {
        let store = LocalStore::in_memory().await.unwrap();
        store
            .save(
                "customers",
                SyncRecord::new("c-1", timestamp::now()).with_field("name", json!("ACME")),
            )
            .await
            .unwrap();
        store
            .save(
                "destinations",
                SyncRecord::new("s-1", timestamp::now())
                    .with_field("name", json!("Lab"))
                    .with_parent("c-1"),
            )
            .await
            .unwrap();
        let outbound = collector::collect(&store).await.unwrap();

        let skipped = [SkippedChange {
            table: "destinations".into(),
            uuid: "s-1".into(),
            reason: "parent customers/c-1 not found".into(),
        }];
        let summary = apply_success(
            &store,
            &outbound,
            Inbound {
                new_sync_timestamp: ts("2024-01-31T10:00:00Z"),
                changes: &ChangeSet::new(),
                uuid_map: &UuidMap::new(),
                skipped: &skipped,
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.acknowledged, 1);
        assert_eq!(summary.rejected, 1);
        assert!(store.get("customers", "c-1").await.unwrap().unwrap().is_synced);
        assert!(!store.get("destinations", "s-1").await.unwrap().unwrap().is_synced);
        assert_eq!(collector::collect(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn full_reset_replaces_local_rows_on_success() {
        let store = LocalStore::in_memory().await.unwrap();
        store
            .save(
                "customers",
                SyncRecord::new("local-only", timestamp::now()).with_field("name", json!("Mine")),
            )
            .await
            .unwrap();
        store.set_watermark(ts("2024-03-01T00:00:00Z")).await.unwrap();

        let dataset = changes(
            "customers",
            vec![wire(json!({"uuid": "c-1", "last_modified": "2024-01-31T10:00:00Z", "name": "ACME"}))],
        );
        let summary = apply_success(
            &store,
            &Outbound::full_reset(),
            response("2024-02-01T00:00:00Z", &dataset, &UuidMap::new()),
        )
        .await
        .unwrap();

        assert_eq!(summary.applied["customers"], 1);
        assert!(store.get("customers", "local-only").await.unwrap().is_none());
        assert!(store.get("customers", "c-1").await.unwrap().is_some());
        // The wipe cleared the old watermark before the new one was stored.
        assert_eq!(store.watermark().await.unwrap(), Some(ts("2024-02-01T00:00:00Z")));
    }

    #[tokio::test]
    async fn remap_with_canonical_present_moves_children() {
        let store = LocalStore::in_memory().await.unwrap();
        for (uuid, name) in [("dup", "ACME"), ("canon", "ACME")] {
            store
                .save(
                    "customers",
                    SyncRecord::new(uuid, timestamp::now()).with_field("name", json!(name)),
                )
                .await
                .unwrap();
        }
        store
            .save(
                "destinations",
                SyncRecord::new("s-1", timestamp::now())
                    .with_field("name", json!("Lab"))
                    .with_parent("dup"),
            )
            .await
            .unwrap();

        let mut map = UuidMap::new();
        map.insert("dup".into(), "canon".into());
        let summary = apply_success(
            &store,
            &Outbound::default(),
            response("2024-01-31T10:00:00Z", &ChangeSet::new(), &map),
        )
        .await
        .unwrap();

        assert_eq!(summary.remapped, 1);
        assert!(store.get("customers", "dup").await.unwrap().is_none());
        let site = store.get("destinations", "s-1").await.unwrap().unwrap();
        assert_eq!(site.record.parent.as_deref(), Some("canon"));
    }

    #[tokio::test]
    async fn remap_without_canonical_renames_in_place() {
        let store = LocalStore::in_memory().await.unwrap();
        store
            .save(
                "customers",
                SyncRecord::new("dup", timestamp::now()).with_field("name", json!("ACME")),
            )
            .await
            .unwrap();
        store
            .save(
                "destinations",
                SyncRecord::new("s-1", timestamp::now())
                    .with_field("name", json!("Lab"))
                    .with_parent("dup"),
            )
            .await
            .unwrap();
        let outbound = collector::collect(&store).await.unwrap();

        let mut map = UuidMap::new();
        map.insert("dup".into(), "canon".into());
        let summary = apply_success(
            &store,
            &outbound,
            response("2024-01-31T10:00:00Z", &ChangeSet::new(), &map),
        )
        .await
        .unwrap();

        assert_eq!(summary.acknowledged, 2);
        let canonical = store.get("customers", "canon").await.unwrap().unwrap();
        assert!(canonical.is_synced);
        let site = store.get("destinations", "s-1").await.unwrap().unwrap();
        assert_eq!(site.record.parent.as_deref(), Some("canon"));
    }

    #[tokio::test]
    async fn cyclic_remap_changes_nothing() {
        let store = LocalStore::in_memory().await.unwrap();
        let mut map = UuidMap::new();
        map.insert("a".into(), "b".into());
        map.insert("b".into(), "a".into());

        let err = apply_success(
            &store,
            &Outbound::default(),
            response("2024-01-31T10:00:00Z", &ChangeSet::new(), &map),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, crate::ClientError::Engine(_)));
        assert_eq!(store.watermark().await.unwrap(), None);
    }
}
