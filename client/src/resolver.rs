//! Applying the user's conflict decisions.
//!
//! Keep-local moves the local row past the server version and records that
//! version as the row's conflict base, so the next push overrides it.
//! Use-server writes the server version into the store as synced.

use tracing::info;
use verisync_engine::{
    decode_record, keep_local_timestamp, ConflictEntry, Decision, Resolution, Timestamp,
};

use crate::apply::{upsert_inbound, Upsert};
use crate::error::{ClientError, Result};
use crate::store::{rows, LocalStore};

/// Counts of applied decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    pub kept_local: usize,
    pub used_server: usize,
}

/// Apply `decisions` for the given `conflicts` in one transaction. Every
/// decision must name a reported conflict.
pub async fn apply_decisions(
    store: &LocalStore,
    conflicts: &[ConflictEntry],
    decisions: &[Decision],
    now: Timestamp,
) -> Result<ResolutionSummary> {
    let mut summary = ResolutionSummary::default();
    let mut tx = store.pool().begin().await?;

    for decision in decisions {
        let entity = store.entity(&decision.table)?;
        let unknown = || ClientError::UnknownRecord {
            table: decision.table.clone(),
            uuid: decision.uuid.clone(),
        };
        let entry = conflicts
            .iter()
            .find(|entry| entry.table == decision.table && entry.uuid == decision.uuid)
            .ok_or_else(unknown)?;

        match decision.resolution {
            Resolution::KeepLocal => {
                let local = rows::fetch_one(&mut tx, entity, &decision.uuid)
                    .await?
                    .ok_or_else(unknown)?;
                let server_last_modified = entry.server_last_modified();
                let last_modified = keep_local_timestamp(now, server_last_modified)
                    .max(local.record.last_modified);
                rows::mark_pending(
                    &mut tx,
                    &entity.name,
                    local.id,
                    last_modified,
                    server_last_modified,
                )
                .await?;
                summary.kept_local += 1;
            }
            Resolution::UseServer => {
                let record = decode_record(entity, entry.server_version.clone())?.record;
                // Drop the pending local edit.
                if let Some(local) = rows::lookup(&mut tx, &entity.name, &record.uuid).await? {
                    if !local.is_synced {
                        sqlx::query(&format!(
                            "UPDATE {} SET is_synced = 1 WHERE id = ?",
                            entity.name
                        ))
                        .bind(local.id)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                if upsert_inbound(&mut tx, entity, record).await? == Upsert::Skipped {
                    return Err(ClientError::UnknownParent {
                        table: entity
                            .parent
                            .as_ref()
                            .map(|parent| parent.table.clone())
                            .unwrap_or_default(),
                        uuid: decision.uuid.clone(),
                    });
                }
                summary.used_server += 1;
            }
        }
    }

    tx.commit().await?;
    info!(
        kept_local = summary.kept_local,
        used_server = summary.used_server,
        "Conflicts resolved"
    );
    Ok(summary)
}
