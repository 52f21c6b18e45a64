//! One sync request, end to end, against an in-memory dataset.

use crate::{
    codec,
    protocol::{ChangeSet, SyncRequest, SyncResponse},
    reconcile::{ApplyPlan, DuplicateRule, Plan, Reconciler},
    timestamp::PullWindow,
    Dataset, Schema, Timestamp,
};

/// What serving a request produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ServeOutcome {
    pub response: SyncResponse,
    /// The committed plan; `None` when the batch conflicted
    pub plan: Option<ApplyPlan>,
}

/// The reconciliation service over a [`Dataset`].
pub struct SyncService<'a> {
    schema: &'a Schema,
    rules: Vec<&'a dyn DuplicateRule>,
}

impl<'a> SyncService<'a> {
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

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    /// Tables with a duplicate rule; planning them needs all their live rows.
    pub fn duplicate_tables(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.table())
    }

    /// A reconciler configured like this service.
    pub fn reconciler(&self) -> Reconciler<'a> {
        self.rules
            .iter()
            .fold(Reconciler::new(self.schema), |reconciler, rule| {
                reconciler.with_duplicate_rule(*rule)
            })
    }

    /// Serve one request: plan the push, commit it if conflict-free, then
    /// answer with the pull window ending at the request's as-of timestamp.
    pub fn serve(
        &self,
        dataset: &mut Dataset,
        request: &SyncRequest,
        wall: Timestamp,
    ) -> ServeOutcome {
        let as_of = dataset.issue_as_of(wall);

        match self.reconciler().plan(request, dataset, as_of) {
            Plan::Conflict(conflicts) => ServeOutcome {
                response: SyncResponse::Conflict { conflicts },
                plan: None,
            },
            Plan::Apply(plan) => {
                dataset.apply(&plan);
                let mut changes =
                    dataset.pull(self.schema, PullWindow::new(request.last_sync_timestamp, as_of));
                add_canonical_rows(&mut changes, self.schema, dataset, &plan);

                ServeOutcome {
                    response: SyncResponse::Success {
                        new_sync_timestamp: as_of,
                        changes,
                        uuid_map: plan.remaps.to_map(),
                        skipped: plan.skipped_changes(),
                    },
                    plan: Some(plan),
                }
            }
        }
    }
}

/// Make sure every canonical row named by a remap reaches the client, even
/// when it falls outside the pull window.
pub fn add_canonical_rows(
    changes: &mut ChangeSet,
    schema: &Schema,
    view: &Dataset,
    plan: &ApplyPlan,
) {
    for (table, uuid) in &plan.canonical_rows {
        let (Some(entity), Some(record)) = (schema.entity(table), view.get(table, uuid)) else {
            continue;
        };
        let rows = changes.entry(table.clone()).or_default();
        let present = rows
            .iter()
            .any(|row| row.get("uuid").and_then(|v| v.as_str()) == Some(uuid.as_str()));
        if !present {
            rows.push(codec::encode_record(entity, record));
        }
    }
}
