//! Row access for the entity tables.
//!
//! Every statement is generated from the table's [`EntityDescriptor`]: the
//! local foreign key column is joined to the parent's `uuid` on the way out
//! and resolved from it on the way in, so integer ids never leave the database.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::{Number, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, Postgres, Row};
use verisync_engine::{timestamp, EntityDescriptor, FieldDef, FieldType, PullWindow, SyncRecord};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// A declared field converted to its column type.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Timestamp(Option<DateTime<Utc>>),
    Bytes(Option<Vec<u8>>),
    Json(Option<Value>),
}

impl SqlValue {
    /// Convert a normalised wire value.
    fn from_field(def: &FieldDef, value: &Value) -> Self {
        match def.field_type {
            FieldType::String => SqlValue::Text(match value {
                Value::Null => None,
                Value::String(text) => Some(text.clone()),
                other => Some(other.to_string()),
            }),
            FieldType::Int => SqlValue::Int(value.as_i64()),
            FieldType::Float => SqlValue::Float(value.as_f64()),
            FieldType::Bool => SqlValue::Bool(value.as_bool()),
            FieldType::Timestamp => SqlValue::Timestamp(
                value.as_str().and_then(|text| timestamp::parse(text).ok()),
            ),
            FieldType::Bytes => SqlValue::Bytes(
                value
                    .as_str()
                    .and_then(|text| STANDARD.decode(text).ok()),
            ),
            FieldType::Json => SqlValue::Json(match value {
                Value::Null => None,
                other => Some(other.clone()),
            }),
        }
    }

    fn bind(self, query: PgQuery<'_>) -> PgQuery<'_> {
        match self {
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Timestamp(v) => query.bind(v),
            SqlValue::Bytes(v) => query.bind(v),
            SqlValue::Json(v) => query.bind(v),
        }
    }
}

/// Read a declared field back into its wire form.
fn read_field(row: &PgRow, def: &FieldDef) -> Result<Value, sqlx::Error> {
    let name = def.name.as_str();
    let value = match def.field_type {
        FieldType::String => row
            .try_get::<Option<String>, _>(name)?
            .map(Value::String),
        FieldType::Int => row.try_get::<Option<i64>, _>(name)?.map(Value::from),
        FieldType::Float => row
            .try_get::<Option<f64>, _>(name)?
            .and_then(Number::from_f64)
            .map(Value::Number),
        FieldType::Bool => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
        FieldType::Timestamp => row
            .try_get::<Option<DateTime<Utc>>, _>(name)?
            .map(|ts| Value::String(timestamp::format(&timestamp::truncate(ts)))),
        FieldType::Bytes => row
            .try_get::<Option<Vec<u8>>, _>(name)?
            .map(|bytes| Value::String(STANDARD.encode(bytes))),
        FieldType::Json => row.try_get::<Option<Value>, _>(name)?,
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Build a [`SyncRecord`] from a row selected with [`select_sql`].
pub fn record_from_row(entity: &EntityDescriptor, row: &PgRow) -> Result<SyncRecord, sqlx::Error> {
    let last_modified: DateTime<Utc> = row.try_get("last_modified")?;
    let mut record = SyncRecord::new(
        row.try_get::<String, _>("uuid")?,
        timestamp::truncate(last_modified),
    );
    record.is_deleted = row.try_get("is_deleted")?;
    record.parent = row.try_get("parent_uuid")?;

    for def in &entity.fields {
        record.fields.insert(def.name.clone(), read_field(row, def)?);
    }
    Ok(record)
}

/// `SELECT` with the parent's uuid joined in as `parent_uuid`.
fn select_sql(entity: &EntityDescriptor) -> String {
    let fields: String = entity
        .fields
        .iter()
        .map(|def| format!(", t.{}", def.name))
        .collect();

    match &entity.parent {
        Some(parent) => format!(
            "SELECT t.uuid, t.last_modified, t.is_deleted, p.uuid AS parent_uuid{fields} \
             FROM {table} t LEFT JOIN {parent_table} p ON p.id = t.{column}",
            table = entity.name,
            parent_table = parent.table,
            column = parent.column,
        ),
        None => format!(
            "SELECT t.uuid, t.last_modified, t.is_deleted, NULL::TEXT AS parent_uuid{fields} \
             FROM {table} t",
            table = entity.name,
        ),
    }
}

/// Rows with the given uuids, tombstones included.
pub async fn fetch_by_uuids(
    conn: &mut PgConnection,
    entity: &EntityDescriptor,
    uuids: &[String],
) -> Result<Vec<SyncRecord>, sqlx::Error> {
    if uuids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!("{} WHERE t.uuid = ANY($1)", select_sql(entity));
    let rows = sqlx::query(&sql).bind(uuids).fetch_all(&mut *conn).await?;
    rows.iter().map(|row| record_from_row(entity, row)).collect()
}

/// Every live row of a table.
pub async fn fetch_live(
    conn: &mut PgConnection,
    entity: &EntityDescriptor,
) -> Result<Vec<SyncRecord>, sqlx::Error> {
    let sql = format!("{} WHERE t.is_deleted = FALSE", select_sql(entity));
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter().map(|row| record_from_row(entity, row)).collect()
}

/// Rows in a pull window, ordered by `last_modified` then uuid.
pub async fn fetch_window(
    conn: &mut PgConnection,
    entity: &EntityDescriptor,
    window: PullWindow,
) -> Result<Vec<SyncRecord>, sqlx::Error> {
    let rows = match window {
        PullWindow::Bootstrap { upto } => {
            let sql = format!(
                "{} WHERE t.is_deleted = FALSE AND t.last_modified <= $1 \
                 ORDER BY t.last_modified, t.uuid",
                select_sql(entity)
            );
            sqlx::query(&sql).bind(upto).fetch_all(&mut *conn).await?
        }
        PullWindow::Incremental { after, upto } => {
            let sql = format!(
                "{} WHERE t.last_modified > $1 AND t.last_modified <= $2 \
                 ORDER BY t.last_modified, t.uuid",
                select_sql(entity)
            );
            sqlx::query(&sql)
                .bind(after)
                .bind(upto)
                .fetch_all(&mut *conn)
                .await?
        }
    };
    rows.iter().map(|row| record_from_row(entity, row)).collect()
}

/// Insert or replace a row, resolving its parent uuid to the local id.
pub async fn upsert_record(
    conn: &mut PgConnection,
    entity: &EntityDescriptor,
    record: &SyncRecord,
) -> Result<(), sqlx::Error> {
    let mut columns = vec![
        "uuid".to_string(),
        "last_modified".to_string(),
        "is_deleted".to_string(),
    ];
    let mut values = vec!["$1".to_string(), "$2".to_string(), "$3".to_string()];

    if let Some(parent) = &entity.parent {
        columns.push(parent.column.clone());
        values.push(format!("(SELECT id FROM {} WHERE uuid = $4)", parent.table));
    }
    for def in &entity.fields {
        columns.push(def.name.clone());
        values.push(format!("${}", values.len() + 1));
    }

    let updates = columns[1..]
        .iter()
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (uuid) DO UPDATE SET {}",
        entity.name,
        columns.join(", "),
        values.join(", "),
        updates
    );

    let mut query = sqlx::query(&sql)
        .bind(record.uuid.clone())
        .bind(record.last_modified)
        .bind(record.is_deleted);
    if entity.parent.is_some() {
        query = query.bind(record.parent.clone());
    }
    for def in &entity.fields {
        query = SqlValue::from_field(def, record.field(&def.name)).bind(query);
    }

    query.execute(&mut *conn).await?;
    Ok(())
}
