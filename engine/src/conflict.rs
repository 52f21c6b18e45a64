//! Conflict detection rule and user-mediated resolutions.

use crate::{protocol::ConflictEntry, RecordUuid, TableName, Timestamp};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Whether a submitted change collides with the server's current row.
///
/// The server row counts as unseen by the client when its `last_modified`
/// is strictly after the client's watermark. A row that carries its own
/// conflict base is judged against that base instead: the client recorded
/// exactly which server version its edit supersedes, which may be older
/// than the watermark when the edit raced a pull. Callers only ask once they
/// know the two versions differ in content.
pub fn is_conflict(
    server_last_modified: Timestamp,
    watermark: Option<Timestamp>,
    base_last_modified: Option<Timestamp>,
) -> bool {
    crate::timestamp::is_after(server_last_modified, base_last_modified.or(watermark))
}

/// The two terminal choices offered for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Resend the local row; it overrides the server version next cycle.
    KeepLocal,
    /// Overwrite the local row with the server version.
    UseServer,
}

/// A resolution bound to one conflicting row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub table: TableName,
    pub uuid: RecordUuid,
    pub resolution: Resolution,
}

impl Decision {
    pub fn new(entry: &ConflictEntry, resolution: Resolution) -> Self {
        Self {
            table: entry.table.clone(),
            uuid: entry.uuid.clone(),
            resolution,
        }
    }

    pub fn keep_local(entry: &ConflictEntry) -> Self {
        Self::new(entry, Resolution::KeepLocal)
    }

    pub fn use_server(entry: &ConflictEntry) -> Self {
        Self::new(entry, Resolution::UseServer)
    }
}

/// New local `last_modified` for a keep-local decision: "now", but never at or
/// before the server version it overrides.
pub fn keep_local_timestamp(now: Timestamp, server_last_modified: Option<Timestamp>) -> Timestamp {
    match server_last_modified {
        Some(server) if now <= server => server + Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::parse;

    #[test]
    fn newer_server_row_conflicts() {
        let t1 = parse("2024-01-01T00:00:00Z").unwrap();
        let t2 = parse("2024-01-02T00:00:00Z").unwrap();

        assert!(is_conflict(t2, Some(t1), None));
        assert!(!is_conflict(t1, Some(t1), None));
        assert!(!is_conflict(t1, Some(t2), None));
    }

    #[test]
    fn never_synced_client_conflicts_with_any_server_row() {
        let t = parse("2024-01-01T00:00:00Z").unwrap();
        assert!(is_conflict(t, None, None));
    }

    #[test]
    fn conflict_base_covers_resolved_server_version() {
        let t1 = parse("2024-01-01T00:00:00Z").unwrap();
        let t2 = parse("2024-01-02T00:00:00Z").unwrap();
        let t3 = parse("2024-01-03T00:00:00Z").unwrap();

        assert!(!is_conflict(t2, Some(t1), Some(t2)));
        assert!(!is_conflict(t2, None, Some(t2)));
        assert!(is_conflict(t3, Some(t1), Some(t2)));
    }

    #[test]
    fn conflict_base_older_than_watermark_still_conflicts() {
        let t1 = parse("2024-01-01T00:00:00Z").unwrap();
        let t2 = parse("2024-01-02T00:00:00Z").unwrap();
        let t3 = parse("2024-01-03T00:00:00Z").unwrap();

        // The watermark moved past t2 while the local edit was based on t1.
        assert!(is_conflict(t2, Some(t3), Some(t1)));
        assert!(!is_conflict(t1, Some(t3), Some(t1)));
    }

    #[test]
    fn keep_local_moves_past_server_version() {
        let now = parse("2024-01-01T00:00:00Z").unwrap();
        let server = parse("2024-01-05T00:00:00Z").unwrap();

        assert_eq!(
            keep_local_timestamp(now, Some(server)),
            server + Duration::microseconds(1)
        );
        assert_eq!(keep_local_timestamp(server + Duration::days(1), Some(server)), server + Duration::days(1));
        assert_eq!(keep_local_timestamp(now, None), now);
    }
}
