//! Sync handler - plans, commits and answers one client cycle.

use tracing::Instrument;
use uuid::Uuid;
use verisync_engine::{
    timestamp, CustomerIdentityRule, ServeOutcome, SyncRequest, SyncResponse, SyncService,
};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::AppState;

/// Customers created independently on two devices are merged server-side.
static CUSTOMER_IDENTITY: CustomerIdentityRule = CustomerIdentityRule;

/// Process a sync request from a client.
pub async fn handle_sync(
    state: &AppState,
    user: &AuthUser,
    request: SyncRequest,
) -> Result<SyncResponse> {
    let span = tracing::info_span!(
        "sync",
        request_id = %Uuid::new_v4(),
        user = %user.username,
        backend = state.backend.name(),
    );

    async move {
        tracing::info!(
            rows = request.row_count(),
            bootstrap = request.is_bootstrap(),
            "Sync request received"
        );

        let service = SyncService::new(&state.schema).with_duplicate_rule(&CUSTOMER_IDENTITY);
        let outcome = state
            .backend
            .serve(&service, &request, timestamp::now())
            .await?;

        log_outcome(&outcome);
        Ok(outcome.response)
    }
    .instrument(span)
    .await
}

fn log_outcome(outcome: &ServeOutcome) {
    let Some(plan) = &outcome.plan else {
        if let SyncResponse::Conflict { conflicts } = &outcome.response {
            tracing::warn!(count = conflicts.len(), "Push rejected with conflicts");
            for conflict in conflicts {
                tracing::debug!(
                    table = %conflict.table,
                    uuid = %conflict.uuid,
                    fields = ?conflict.differing_fields(),
                    "Conflicting row"
                );
            }
        }
        return;
    };

    for table in &plan.ignored_tables {
        tracing::warn!(table = %table, "Ignoring unknown table");
    }
    for skipped in &plan.skipped {
        tracing::warn!(
            table = %skipped.table,
            uuid = skipped.uuid.as_deref().unwrap_or("-"),
            reason = %skipped.reason,
            "Skipping row"
        );
    }
    for notice in &plan.notices {
        tracing::debug!(
            table = %notice.table,
            uuid = %notice.uuid,
            dropped = ?notice.dropped,
            nulled = ?notice.nulled,
            "Normalised row"
        );
    }
    for (duplicate, canonical) in plan.remaps.iter() {
        tracing::warn!(duplicate = %duplicate, canonical = %canonical, "Merged duplicate row");
    }

    let pulled: usize = match &outcome.response {
        SyncResponse::Success { changes, .. } => changes.values().map(Vec::len).sum(),
        _ => 0,
    };
    tracing::info!(
        inserted = plan.insert_count(),
        updated = plan.update_count(),
        unchanged = plan.unchanged.len(),
        skipped = plan.skipped.len(),
        pulled,
        as_of = %timestamp::format(&plan.as_of),
        "Sync committed"
    );
}
