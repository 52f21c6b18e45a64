//! Descriptor-driven row access for the local SQLite tables.
//!
//! Every function works on a bare connection so callers can compose them
//! inside one transaction. Parent links are stored as local integer ids and
//! read back as the parent's uuid.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection};
use verisync_engine::{
    timestamp, EntityDescriptor, FieldDef, FieldType, Schema, SyncRecord, Timestamp,
};

use crate::error::Result;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

const WATERMARK_KEY: &str = "last_sync_timestamp";

/// A stored row with its local bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRow {
    /// Local primary key, never transmitted
    pub id: i64,
    /// Whether the server has acknowledged the current version
    pub is_synced: bool,
    /// The row in transport form; `base_last_modified` holds the conflict base
    pub record: SyncRecord,
}

/// Identity and state of a row, without its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef {
    pub id: i64,
    pub is_deleted: bool,
    pub is_synced: bool,
}

/// A declared field converted to its column type.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Bytes(Option<Vec<u8>>),
}

impl SqlValue {
    fn from_field(def: &FieldDef, value: &Value) -> Self {
        match def.field_type {
            FieldType::String | FieldType::Timestamp => SqlValue::Text(match value {
                Value::Null => None,
                Value::String(text) => Some(text.clone()),
                other => Some(other.to_string()),
            }),
            FieldType::Int => SqlValue::Int(value.as_i64()),
            FieldType::Float => SqlValue::Float(value.as_f64()),
            FieldType::Bool => SqlValue::Bool(value.as_bool()),
            FieldType::Bytes => SqlValue::Bytes(
                value
                    .as_str()
                    .and_then(|text| STANDARD.decode(text).ok()),
            ),
            FieldType::Json => SqlValue::Text(match value {
                Value::Null => None,
                other => Some(other.to_string()),
            }),
        }
    }

    fn bind(self, query: SqliteQuery<'_>) -> SqliteQuery<'_> {
        match self {
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Bytes(v) => query.bind(v),
        }
    }
}

fn read_field(row: &SqliteRow, def: &FieldDef) -> Result<Value> {
    let name = def.name.as_str();
    let value = match def.field_type {
        FieldType::String | FieldType::Timestamp => row
            .try_get::<Option<String>, _>(name)?
            .map(Value::String),
        FieldType::Int => row.try_get::<Option<i64>, _>(name)?.map(Value::from),
        FieldType::Float => row
            .try_get::<Option<f64>, _>(name)?
            .and_then(Number::from_f64)
            .map(Value::Number),
        FieldType::Bool => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
        FieldType::Bytes => row
            .try_get::<Option<Vec<u8>>, _>(name)?
            .map(|bytes| Value::String(STANDARD.encode(bytes))),
        FieldType::Json => row
            .try_get::<Option<String>, _>(name)?
            .map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text))),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn row_from_sqlite(entity: &EntityDescriptor, row: &SqliteRow) -> Result<LocalRow> {
    let last_modified: String = row.try_get("last_modified")?;
    let mut record = SyncRecord::new(
        row.try_get::<String, _>("uuid")?,
        timestamp::parse(&last_modified)?,
    );
    record.is_deleted = row.try_get("is_deleted")?;
    record.parent = row.try_get("parent_uuid")?;
    record.base_last_modified = row
        .try_get::<Option<String>, _>("sync_base")?
        .map(|text| timestamp::parse(&text))
        .transpose()?;

    for def in &entity.fields {
        record.fields.insert(def.name.clone(), read_field(row, def)?);
    }

    Ok(LocalRow {
        id: row.try_get("id")?,
        is_synced: row.try_get("is_synced")?,
        record,
    })
}

fn select_sql(entity: &EntityDescriptor) -> String {
    let fields: String = entity
        .fields
        .iter()
        .map(|def| format!(", t.{}", def.name))
        .collect();

    match &entity.parent {
        Some(parent) => format!(
            "SELECT t.id, t.uuid, t.last_modified, t.is_synced, t.is_deleted, t.sync_base, \
             p.uuid AS parent_uuid{fields} \
             FROM {table} t LEFT JOIN {parent_table} p ON p.id = t.{column}",
            table = entity.name,
            parent_table = parent.table,
            column = parent.column,
        ),
        None => format!(
            "SELECT t.id, t.uuid, t.last_modified, t.is_synced, t.is_deleted, t.sync_base, \
             NULL AS parent_uuid{fields} FROM {table} t",
            table = entity.name,
        ),
    }
}

/// One row by uuid, tombstones included.
pub async fn fetch_one(
    conn: &mut SqliteConnection,
    entity: &EntityDescriptor,
    uuid: &str,
) -> Result<Option<LocalRow>> {
    let sql = format!("{} WHERE t.uuid = ?", select_sql(entity));
    let row = sqlx::query(&sql).bind(uuid).fetch_optional(&mut *conn).await?;
    row.map(|row| row_from_sqlite(entity, &row)).transpose()
}

/// Rows with local changes, in creation order.
pub async fn fetch_unsynced(
    conn: &mut SqliteConnection,
    entity: &EntityDescriptor,
) -> Result<Vec<LocalRow>> {
    let sql = format!("{} WHERE t.is_synced = 0 ORDER BY t.id", select_sql(entity));
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter().map(|row| row_from_sqlite(entity, row)).collect()
}

/// Live rows, in creation order.
pub async fn fetch_live(
    conn: &mut SqliteConnection,
    entity: &EntityDescriptor,
) -> Result<Vec<LocalRow>> {
    let sql = format!("{} WHERE t.is_deleted = 0 ORDER BY t.id", select_sql(entity));
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter().map(|row| row_from_sqlite(entity, row)).collect()
}

/// Local id and flags of a row.
pub async fn lookup(
    conn: &mut SqliteConnection,
    table: &str,
    uuid: &str,
) -> Result<Option<RowRef>> {
    let sql = format!("SELECT id, is_deleted, is_synced FROM {table} WHERE uuid = ?");
    let row = sqlx::query(&sql).bind(uuid).fetch_optional(&mut *conn).await?;
    row.map(|row| -> Result<RowRef> {
        Ok(RowRef {
            id: row.try_get("id")?,
            is_deleted: row.try_get("is_deleted")?,
            is_synced: row.try_get("is_synced")?,
        })
    })
    .transpose()
}

/// Live children of `parent_id` in `child`, as (id, uuid).
pub async fn live_children(
    conn: &mut SqliteConnection,
    child: &EntityDescriptor,
    parent_id: i64,
) -> Result<Vec<(i64, String)>> {
    let Some(parent) = &child.parent else {
        return Ok(Vec::new());
    };
    let sql = format!(
        "SELECT id, uuid FROM {} WHERE {} = ? AND is_deleted = 0",
        child.name, parent.column
    );
    let rows = sqlx::query(&sql)
        .bind(parent_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| -> Result<(i64, String)> {
            Ok((row.try_get("id")?, row.try_get("uuid")?))
        })
        .collect()
}

/// Insert or replace a row keyed by uuid. The local id of an existing row
/// is kept.
pub async fn write_row(
    conn: &mut SqliteConnection,
    entity: &EntityDescriptor,
    record: &SyncRecord,
    parent_id: Option<i64>,
    is_synced: bool,
) -> Result<()> {
    let mut columns = vec![
        "uuid".to_string(),
        "last_modified".to_string(),
        "is_synced".to_string(),
        "is_deleted".to_string(),
        "sync_base".to_string(),
    ];
    if let Some(parent) = &entity.parent {
        columns.push(parent.column.clone());
    }
    columns.extend(entity.fields.iter().map(|def| def.name.clone()));

    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates = columns[1..]
        .iter()
        .map(|column| format!("{column} = excluded.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (uuid) DO UPDATE SET {}",
        entity.name,
        columns.join(", "),
        placeholders,
        updates
    );

    let mut query = sqlx::query(&sql)
        .bind(&record.uuid)
        .bind(timestamp::format(&record.last_modified))
        .bind(is_synced)
        .bind(record.is_deleted)
        .bind(record.base_last_modified.as_ref().map(timestamp::format));
    if entity.parent.is_some() {
        query = query.bind(parent_id);
    }
    for def in &entity.fields {
        query = SqlValue::from_field(def, record.field(&def.name)).bind(query);
    }

    query.execute(&mut *conn).await?;
    Ok(())
}

/// Acknowledge a pushed row, unless it was edited again since it was sent.
pub async fn mark_synced(
    conn: &mut SqliteConnection,
    table: &str,
    uuid: &str,
    last_modified: Timestamp,
) -> Result<bool> {
    let sql = format!(
        "UPDATE {table} SET is_synced = 1, sync_base = NULL \
         WHERE uuid = ? AND last_modified = ?"
    );
    let result = sqlx::query(&sql)
        .bind(uuid)
        .bind(timestamp::format(&last_modified))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Flag a row as locally changed, optionally recording the server version
/// it overrides.
pub async fn mark_pending(
    conn: &mut SqliteConnection,
    table: &str,
    id: i64,
    last_modified: Timestamp,
    base: Option<Timestamp>,
) -> Result<()> {
    let sql = format!(
        "UPDATE {table} SET is_synced = 0, last_modified = ?, sync_base = ? WHERE id = ?"
    );
    sqlx::query(&sql)
        .bind(timestamp::format(&last_modified))
        .bind(base.as_ref().map(timestamp::format))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Turn a row into an unsynced tombstone.
pub async fn tombstone(
    conn: &mut SqliteConnection,
    table: &str,
    id: i64,
    at: Timestamp,
) -> Result<()> {
    let sql = format!(
        "UPDATE {table} SET is_deleted = 1, is_synced = 0, last_modified = ? WHERE id = ?"
    );
    sqlx::query(&sql)
        .bind(timestamp::format(&at))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Move every child row of `from` in `child` under `to`.
pub async fn repoint_children(
    conn: &mut SqliteConnection,
    child: &EntityDescriptor,
    from: i64,
    to: i64,
) -> Result<u64> {
    let Some(parent) = &child.parent else {
        return Ok(0);
    };
    let sql = format!(
        "UPDATE {table} SET {column} = ? WHERE {column} = ?",
        table = child.name,
        column = parent.column
    );
    let result = sqlx::query(&sql)
        .bind(to)
        .bind(from)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Record which server version a pending row's edit is based on.
///
/// With `replace` unset an existing base wins; it is older or equal and still
/// describes what the edit overrides.
pub async fn pin_base(
    conn: &mut SqliteConnection,
    table: &str,
    uuid: &str,
    base: Timestamp,
    replace: bool,
) -> Result<()> {
    let assignment = if replace {
        "sync_base = ?"
    } else {
        "sync_base = COALESCE(sync_base, ?)"
    };
    let sql = format!("UPDATE {table} SET {assignment} WHERE uuid = ? AND is_synced = 0");
    sqlx::query(&sql)
        .bind(timestamp::format(&base))
        .bind(uuid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Physically remove a row. Only identity remaps and full resets do this.
pub async fn delete_row(conn: &mut SqliteConnection, table: &str, id: i64) -> Result<()> {
    let sql = format!("DELETE FROM {table} WHERE id = ?");
    sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
    Ok(())
}

/// Rewrite a row's uuid in place.
pub async fn rename_uuid(
    conn: &mut SqliteConnection,
    table: &str,
    from: &str,
    to: &str,
) -> Result<()> {
    let sql = format!("UPDATE {table} SET uuid = ? WHERE uuid = ?");
    sqlx::query(&sql).bind(to).bind(from).execute(&mut *conn).await?;
    Ok(())
}

/// Delete every row of every table, children first, and the watermark.
pub async fn wipe(conn: &mut SqliteConnection, schema: &Schema) -> Result<()> {
    for entity in schema.entities().rev() {
        sqlx::query(&format!("DELETE FROM {}", entity.name))
            .execute(&mut *conn)
            .await?;
    }
    clear_watermark(conn).await
}

/// Number of rows awaiting acknowledgement.
pub async fn count_unsynced(conn: &mut SqliteConnection, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE is_synced = 0");
    Ok(sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut *conn).await?)
}

/// The stored watermark.
pub async fn read_watermark(conn: &mut SqliteConnection) -> Result<Option<Timestamp>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?")
        .bind(WATERMARK_KEY)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value.map(|text| timestamp::parse(&text)).transpose()?)
}

/// Move the watermark forward; it never goes back. Returns the stored value.
pub async fn advance_watermark(
    conn: &mut SqliteConnection,
    to: Timestamp,
) -> Result<Timestamp> {
    let next = match read_watermark(conn).await? {
        Some(current) => current.max(to),
        None => to,
    };
    sqlx::query(
        "INSERT INTO sync_state (key, value) VALUES (?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(WATERMARK_KEY)
    .bind(timestamp::format(&next))
    .execute(&mut *conn)
    .await?;
    Ok(next)
}

/// Forget the watermark so the next cycle bootstraps.
pub async fn clear_watermark(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM sync_state WHERE key = ?")
        .bind(WATERMARK_KEY)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
