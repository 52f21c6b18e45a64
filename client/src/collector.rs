//! Change collection: unsynced local rows rendered as wire rows.

use tracing::{debug, warn};
use verisync_engine::{encode_record, ChangeSet, TableName, Timestamp};

use crate::error::Result;
use crate::store::{rows, LocalStore};

/// Identity and version of a row that went out, for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRow {
    pub table: TableName,
    pub uuid: String,
    pub last_modified: Timestamp,
}

/// One cycle's outbound batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outbound {
    /// Wire rows per table, parents before children
    pub changes: ChangeSet,
    /// Every row in `changes`, with the version that was sent
    pub sent: Vec<SentRow>,
    /// Watermark read together with the rows
    pub watermark: Option<Timestamp>,
    /// Replace the whole local store with the server's dataset on success
    pub reset: bool,
}

impl Outbound {
    /// An empty bootstrap request whose response replaces the local store.
    pub fn full_reset() -> Self {
        Self {
            reset: true,
            ..Self::default()
        }
    }

    /// Whether `uuid` in `table` went out in this batch.
    pub fn contains(&self, table: &str, uuid: &str) -> bool {
        self.sent
            .iter()
            .any(|row| row.table == table && row.uuid == uuid)
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

/// Gather every unsynced row, in dependency order, without touching the
/// store. A child whose parent link is missing locally stays behind.
pub async fn collect(store: &LocalStore) -> Result<Outbound> {
    let mut outbound = Outbound::default();
    // One read transaction, so the batch is a consistent snapshot.
    let mut tx = store.pool().begin().await?;

    for entity in store.schema().entities() {
        let mut wire_rows = Vec::new();
        for row in rows::fetch_unsynced(&mut tx, entity).await? {
            if entity.parent.is_some() && row.record.parent.is_none() {
                warn!(
                    table = %entity.name,
                    uuid = %row.record.uuid,
                    "Holding back row without a parent link"
                );
                continue;
            }

            wire_rows.push(encode_record(entity, &row.record));
            outbound.sent.push(SentRow {
                table: entity.name.clone(),
                uuid: row.record.uuid,
                last_modified: row.record.last_modified,
            });
        }

        if !wire_rows.is_empty() {
            debug!(table = %entity.name, rows = wire_rows.len(), "Collected changes");
            outbound.changes.insert(entity.name.clone(), wire_rows);
        }
    }

    outbound.watermark = rows::read_watermark(&mut tx).await?;
    tx.rollback().await?;
    Ok(outbound)
}
