//! The sync transaction for the PostgreSQL backend.
//!
//! Requests are serialised by a transaction-scoped advisory lock taken before
//! the as-of timestamp is issued, so no commit can land inside a window that
//! has already been handed out. Planning runs against a view hydrated with
//! just the rows the batch touches.

use super::records::{fetch_by_uuids, fetch_live, fetch_window, upsert_record};
use super::Pool;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use std::collections::{BTreeMap, BTreeSet};
use verisync_engine::{
    codec, service::add_canonical_rows, ChangeSet, Dataset, EntityDescriptor, Plan, PullWindow,
    RecordUuid, ServeOutcome, ServerClock, SyncRecord, SyncRequest, SyncResponse, SyncService,
    TableName, Timestamp,
};

/// Advisory lock key shared by every sync transaction.
const SYNC_LOCK_KEY: i64 = 0x7665_7269_7379_6e63;

/// Serve one request inside a single transaction.
pub async fn serve_sync(
    pool: &Pool,
    service: &SyncService<'_>,
    request: &SyncRequest,
    wall: Timestamp,
) -> Result<ServeOutcome, sqlx::Error> {
    let schema = service.schema();
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SYNC_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    let as_of = issue_as_of(&mut tx, wall).await?;

    let view = hydrate(&mut tx, service, request).await?;
    let plan = match service.reconciler().plan(request, &view, as_of) {
        Plan::Conflict(conflicts) => {
            tx.rollback().await?;
            return Ok(ServeOutcome {
                response: SyncResponse::Conflict { conflicts },
                plan: None,
            });
        }
        Plan::Apply(plan) => plan,
    };

    for write in &plan.writes {
        if let Some(entity) = schema.entity(&write.table) {
            upsert_record(&mut tx, entity, &write.record).await?;
        }
    }

    let window = PullWindow::new(request.last_sync_timestamp, as_of);
    let mut changes = ChangeSet::new();
    for entity in schema.entities() {
        let rows = fetch_window(&mut tx, entity, window).await?;
        if !rows.is_empty() {
            changes.insert(
                entity.name.clone(),
                rows.iter()
                    .map(|row| codec::encode_record(entity, row))
                    .collect(),
            );
        }
    }
    add_canonical_rows(&mut changes, schema, &view, &plan);

    tx.commit().await?;

    Ok(ServeOutcome {
        response: SyncResponse::Success {
            new_sync_timestamp: as_of,
            changes,
            uuid_map: plan.remaps.to_map(),
            skipped: plan.skipped_changes(),
        },
        plan: Some(plan),
    })
}

/// Write one row outside a sync cycle, stamped with the next as-of timestamp
/// so every device pulls it on its next cycle.
pub async fn write_stamped(
    pool: &Pool,
    entity: &EntityDescriptor,
    mut record: SyncRecord,
    wall: Timestamp,
) -> Result<SyncRecord, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SYNC_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    record.last_modified = issue_as_of(&mut tx, wall).await?;
    upsert_record(&mut tx, entity, &record).await?;

    tx.commit().await?;
    Ok(record)
}

/// Fetch one live row by uuid.
pub async fn read_live(
    pool: &Pool,
    entity: &EntityDescriptor,
    uuid: &str,
) -> Result<Option<SyncRecord>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let rows = fetch_by_uuids(&mut conn, entity, &[uuid.to_string()]).await?;
    Ok(rows.into_iter().find(SyncRecord::is_active))
}

/// Issue the next as-of timestamp from the persisted server clock.
async fn issue_as_of(conn: &mut PgConnection, wall: Timestamp) -> Result<Timestamp, sqlx::Error> {
    let last_issued: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT last_issued FROM sync_clock WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?
            .flatten();

    let as_of = ServerClock::resume(last_issued).issue(wall);

    sqlx::query(
        r#"
        INSERT INTO sync_clock (id, last_issued)
        VALUES (1, $1)
        ON CONFLICT (id) DO UPDATE SET last_issued = EXCLUDED.last_issued
        "#,
    )
    .bind(as_of)
    .execute(&mut *conn)
    .await?;

    Ok(as_of)
}

/// Load the rows the batch names, their parents, and every live row of tables
/// with a duplicate rule.
async fn hydrate(
    conn: &mut PgConnection,
    service: &SyncService<'_>,
    request: &SyncRequest,
) -> Result<Dataset, sqlx::Error> {
    let schema = service.schema();
    let mut wanted: BTreeMap<TableName, BTreeSet<RecordUuid>> = BTreeMap::new();

    for (table, rows) in &request.changes {
        let Some(entity) = schema.entity(table) else {
            continue;
        };
        for raw in rows {
            let Ok(decoded) = codec::decode_record(entity, raw.clone()) else {
                continue;
            };
            wanted
                .entry(table.clone())
                .or_default()
                .insert(decoded.record.uuid);
            if let (Some(parent_ref), Some(parent)) = (&entity.parent, decoded.record.parent) {
                wanted
                    .entry(parent_ref.table.clone())
                    .or_default()
                    .insert(parent);
            }
        }
    }

    let mut view = Dataset::new();
    for (table, uuids) in &wanted {
        let Some(entity) = schema.entity(table) else {
            continue;
        };
        let uuids: Vec<RecordUuid> = uuids.iter().cloned().collect();
        for record in fetch_by_uuids(conn, entity, &uuids).await? {
            view.put(table.clone(), record);
        }
    }

    for table in service.duplicate_tables() {
        let Some(entity) = schema.entity(table) else {
            continue;
        };
        if !request.changes.contains_key(table) {
            continue;
        }
        for record in fetch_live(conn, entity).await? {
            view.put(table, record);
        }
    }

    Ok(view)
}
