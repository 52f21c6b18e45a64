//! The local record store.
//!
//! SQLite through sqlx, one table per entity descriptor. Besides the declared
//! fields every table carries `uuid`, `last_modified`, `is_synced`,
//! `is_deleted` and `sync_base` (the server version a keep-local decision
//! overrides). The watermark lives in `sync_state`.

pub mod rows;

use std::str::FromStr;
use std::sync::Arc;

use chrono::Duration;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;
use verisync_engine::{
    codec, decode_record, encode_record, timestamp, EntityDescriptor, Error as EngineError, Schema,
    SyncRecord, Timestamp,
};

use crate::config::StoreConfig;
use crate::error::{ClientError, Result};

pub use rows::{LocalRow, RowRef};

/// Handle to the local SQLite store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    schema: Arc<Schema>,
}

impl LocalStore {
    /// Open (creating if needed) and migrate the store.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let options = match &config.path {
            Some(path) => {
                info!(path = %path.display(), "Opening local store");
                SqliteConnectOptions::new()
                    .filename(path)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .create_if_missing(true)
            }
            None => SqliteConnectOptions::from_str("sqlite::memory:")?,
        }
        .foreign_keys(true);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout);
        if config.path.is_none() {
            // Dropping the only connection would drop the database.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(max_connections = config.max_connections, "Local store ready");

        Ok(Self {
            pool,
            schema: Arc::new(Schema::standard()),
        })
    }

    /// Fresh in-memory store, for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn entity(&self, table: &str) -> Result<&EntityDescriptor> {
        self.schema
            .entity(table)
            .ok_or_else(|| ClientError::UnknownTable(table.to_string()))
    }

    /// The watermark of the last successful cycle, `None` before the first.
    pub async fn watermark(&self) -> Result<Option<Timestamp>> {
        let mut conn = self.pool.acquire().await?;
        rows::read_watermark(&mut conn).await
    }

    /// Advance the watermark; a value older than the stored one is ignored.
    pub async fn set_watermark(&self, to: Timestamp) -> Result<Timestamp> {
        let mut conn = self.pool.acquire().await?;
        rows::advance_watermark(&mut conn, to).await
    }

    /// One row by uuid, tombstones included.
    pub async fn get(&self, table: &str, uuid: &str) -> Result<Option<LocalRow>> {
        let entity = self.entity(table)?;
        let mut conn = self.pool.acquire().await?;
        rows::fetch_one(&mut conn, entity, uuid).await
    }

    /// Every live row of a table.
    pub async fn list(&self, table: &str) -> Result<Vec<LocalRow>> {
        let entity = self.entity(table)?;
        let mut conn = self.pool.acquire().await?;
        rows::fetch_live(&mut conn, entity).await
    }

    /// Rows of a table waiting for the next push.
    pub async fn unsynced(&self, table: &str) -> Result<Vec<LocalRow>> {
        let entity = self.entity(table)?;
        let mut conn = self.pool.acquire().await?;
        rows::fetch_unsynced(&mut conn, entity).await
    }

    /// Rows waiting for the next push, across every table.
    pub async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        let mut total = 0;
        for entity in self.schema.entities() {
            total += rows::count_unsynced(&mut conn, &entity.name).await?;
        }
        Ok(total as usize)
    }

    /// Create or edit a row on behalf of business logic.
    ///
    /// The parent is given by uuid and must be live locally. Fields are
    /// normalised like inbound rows. An empty uuid gets a fresh one; tables
    /// keyed by a natural field derive it. The stored version is returned.
    pub async fn save(&self, table: &str, record: SyncRecord) -> Result<SyncRecord> {
        let entity = self.entity(table)?;
        let mut record = decode_record(entity, encode_for_save(entity, record))?.record;

        let mut tx = self.pool.begin().await?;

        let parent_id = match &entity.parent {
            Some(parent_ref) => {
                let parent_uuid = record
                    .parent
                    .as_deref()
                    .ok_or_else(|| EngineError::MissingParentRef(entity.name.clone()))?;
                match rows::lookup(&mut tx, &parent_ref.table, parent_uuid).await? {
                    Some(parent) if !parent.is_deleted => Some(parent.id),
                    _ => {
                        return Err(ClientError::UnknownParent {
                            table: parent_ref.table.clone(),
                            uuid: parent_uuid.to_string(),
                        })
                    }
                }
            }
            None => None,
        };

        let existing = rows::fetch_one(&mut tx, entity, &record.uuid).await?;
        let previous = existing.as_ref().map(|row| row.record.last_modified);
        record.last_modified = next_edit_time(previous);
        record.base_last_modified = existing.and_then(|row| row.record.base_last_modified);

        rows::write_row(&mut tx, entity, &record, parent_id, false).await?;
        tx.commit().await?;

        debug!(table = %entity.name, uuid = %record.uuid, "Saved row");
        Ok(record)
    }

    /// Delete a row on behalf of business logic.
    ///
    /// Tombstoning cascades to every live descendant. Tables without
    /// tombstones are cleared instead: every field but the natural key goes
    /// null. Returns the number of rows touched.
    pub async fn soft_delete(&self, table: &str, uuid: &str) -> Result<usize> {
        let entity = self.entity(table)?;
        let mut tx = self.pool.begin().await?;

        let Some(row) = rows::fetch_one(&mut tx, entity, uuid).await? else {
            return Err(ClientError::UnknownRecord {
                table: table.to_string(),
                uuid: uuid.to_string(),
            });
        };
        let at = next_edit_time(Some(row.record.last_modified));

        let touched = if entity.tombstones {
            if row.record.is_deleted {
                return Ok(0);
            }
            self.tombstone_tree(&mut tx, entity, row.id, at).await?
        } else {
            let mut cleared = row.record;
            for def in &entity.fields {
                if entity.identity_field.as_deref() != Some(def.name.as_str()) {
                    cleared.fields.insert(def.name.clone(), serde_json::Value::Null);
                }
            }
            cleared.last_modified = at;
            let parent_id = match (&entity.parent, &cleared.parent) {
                (Some(parent_ref), Some(parent_uuid)) => {
                    rows::lookup(&mut tx, &parent_ref.table, parent_uuid)
                        .await?
                        .map(|parent| parent.id)
                }
                _ => None,
            };
            rows::write_row(&mut tx, entity, &cleared, parent_id, false).await?;
            1
        };

        tx.commit().await?;
        debug!(table = %entity.name, uuid = %uuid, rows = touched, "Deleted row");
        Ok(touched)
    }

    async fn tombstone_tree(
        &self,
        conn: &mut SqliteConnection,
        root: &EntityDescriptor,
        root_id: i64,
        at: Timestamp,
    ) -> Result<usize> {
        let mut pending = vec![(root, root_id)];
        let mut touched = 0;

        while let Some((entity, id)) = pending.pop() {
            rows::tombstone(conn, &entity.name, id, at).await?;
            touched += 1;

            for child in self.schema.children_of(&entity.name) {
                for (child_id, _) in rows::live_children(conn, child, id).await? {
                    pending.push((child, child_id));
                }
            }
        }

        Ok(touched)
    }

    /// Remove every syncable row and forget the watermark, so the next
    /// cycle is a bootstrap.
    pub async fn wipe_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        rows::wipe(&mut tx, &self.schema).await?;
        tx.commit().await?;

        warn!("Local store wiped for a full resync");
        Ok(())
    }

    /// Mark every row unsynced with a fresh `last_modified` so the next
    /// cycle re-sends the whole local dataset. Placeholder serial numbers are
    /// normalised to null on the way. Returns the number of rows marked.
    pub async fn mark_all_for_push(&self) -> Result<usize> {
        let now = timestamp::format(&timestamp::now());
        let mut tx = self.pool.begin().await?;
        let mut marked = 0;

        for entity in self.schema.entities() {
            for def in entity.fields.iter().filter(|def| def.placeholder_null) {
                let markers = vec!["?"; codec::PLACEHOLDERS.len()].join(", ");
                let sql = format!(
                    "UPDATE {table} SET {column} = NULL WHERE {column} IS NOT NULL \
                     AND (TRIM({column}) = '' OR UPPER(TRIM({column})) IN ({markers}))",
                    table = entity.name,
                    column = def.name,
                );
                let mut query = sqlx::query(&sql);
                for placeholder in codec::PLACEHOLDERS {
                    query = query.bind(*placeholder);
                }
                let cleaned = query.execute(&mut *tx).await?.rows_affected();
                if cleaned > 0 {
                    info!(table = %entity.name, field = %def.name, rows = cleaned, "Normalised placeholders");
                }
            }

            let sql = format!(
                "UPDATE {} SET is_synced = 0, last_modified = ?",
                entity.name
            );
            let result = sqlx::query(&sql).bind(&now).execute(&mut *tx).await?;
            marked += result.rows_affected() as usize;
        }

        tx.commit().await?;
        info!(rows = marked, "Marked every row for push");
        Ok(marked)
    }
}

/// `now`, but strictly after the previous version so an edit is never
/// mistaken for the version already sent.
fn next_edit_time(previous: Option<Timestamp>) -> Timestamp {
    let now = timestamp::now();
    match previous {
        Some(previous) if now <= previous => previous + Duration::microseconds(1),
        _ => now,
    }
}

fn encode_for_save(entity: &EntityDescriptor, mut record: SyncRecord) -> verisync_engine::WireRecord {
    let keyed = entity
        .identity_field
        .as_deref()
        .and_then(|name| entity.derive_uuid(record.field(name)));
    if let Some(uuid) = keyed {
        record.uuid = uuid;
    } else if record.uuid.trim().is_empty() {
        record.uuid = Uuid::new_v4().to_string();
    }
    encode_record(entity, &record)
}
