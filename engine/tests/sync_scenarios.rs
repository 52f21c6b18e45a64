//! Multi-request scenarios for the reconciliation service
//!
//! Each test drives a [`SyncService`] through several requests the way two
//! devices would, and checks what each of them gets back.

use chrono::Duration;
use serde_json::{json, Value};
use verisync_engine::{
    timestamp, ChangeSet, CustomerIdentityRule, Dataset, Schema, SyncRequest, SyncResponse,
    SyncService, Timestamp, WireRecord,
};

fn at(s: &str) -> Timestamp {
    timestamp::parse(s).unwrap()
}

fn row(value: Value) -> WireRecord {
    match value {
        Value::Object(map) => map,
        _ => panic!("wire rows are objects"),
    }
}

fn customer(uuid: &str, name: &str, last_modified: &str) -> WireRecord {
    row(json!({
        "uuid": uuid,
        "last_modified": last_modified,
        "name": name,
        "address": "Via Roma 1",
    }))
}

fn destination(uuid: &str, customer: &str, last_modified: &str) -> WireRecord {
    row(json!({
        "uuid": uuid,
        "last_modified": last_modified,
        "customer_uuid": customer,
        "name": "Main lab",
    }))
}

fn device(uuid: &str, destination: &str, last_modified: &str) -> WireRecord {
    row(json!({
        "uuid": uuid,
        "last_modified": last_modified,
        "destination_uuid": destination,
        "serial_number": "SN-1",
        "description": "Infusion pump",
    }))
}

/// Unwrap a success, returning (watermark, changes).
fn success(response: SyncResponse) -> (Timestamp, ChangeSet) {
    match response {
        SyncResponse::Success {
            new_sync_timestamp,
            changes,
            ..
        } => (new_sync_timestamp, changes),
        other => panic!("expected success, got {other:?}"),
    }
}

fn uuids(changes: &ChangeSet, table: &str) -> Vec<String> {
    changes
        .get(table)
        .map(|rows| {
            rows.iter()
                .map(|r| r["uuid"].as_str().unwrap().to_string())
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Push and pull
// ============================================================================

#[test]
fn full_hierarchy_in_one_push() {
    let schema = Schema::standard();
    let service = SyncService::new(&schema);
    let mut dataset = Dataset::new();

    let request = SyncRequest::new(None)
        .with_changes("devices", vec![device("d-1", "s-1", "2024-01-01T10:00:00Z")])
        .with_changes(
            "destinations",
            vec![destination("s-1", "c-1", "2024-01-01T10:00:00Z")],
        )
        .with_changes(
            "customers",
            vec![customer("c-1", "ACME", "2024-01-01T10:00:00Z")],
        );

    let outcome = service.serve(&mut dataset, &request, at("2024-01-02T00:00:00Z"));
    let (_, changes) = success(outcome.response);

    assert_eq!(uuids(&changes, "customers"), vec!["c-1"]);
    assert_eq!(uuids(&changes, "destinations"), vec!["s-1"]);
    assert_eq!(uuids(&changes, "devices"), vec!["d-1"]);
    assert_eq!(changes["devices"][0]["destination_uuid"], json!("s-1"));
}

#[test]
fn resending_a_committed_batch_changes_nothing() {
    let schema = Schema::standard();
    let service = SyncService::new(&schema);
    let mut dataset = Dataset::new();

    let request = SyncRequest::new(None)
        .with_changes("customers", vec![customer("c-1", "ACME", "2024-01-01T10:00:00Z")])
        .with_changes(
            "destinations",
            vec![destination("s-1", "c-1", "2024-01-01T10:00:00Z")],
        );

    success(service.serve(&mut dataset, &request, at("2024-01-02T00:00:00Z")).response);
    let before = dataset.clone();

    // The response was lost, so the client retries with its old watermark.
    let outcome = service.serve(&mut dataset, &request, at("2024-01-03T00:00:00Z"));
    let plan = outcome.plan.expect("resend is accepted");

    assert!(plan.writes.is_empty());
    assert_eq!(plan.unchanged.len(), 2);
    assert_eq!(dataset.get("customers", "c-1"), before.get("customers", "c-1"));
    assert_eq!(
        dataset.get("destinations", "s-1"),
        before.get("destinations", "s-1")
    );
}

#[test]
fn bootstrap_then_incremental() {
    let schema = Schema::standard();
    let service = SyncService::new(&schema);
    let mut dataset = Dataset::new();

    // Device A creates two customers and deletes one of them later.
    let (mark_a, _) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(None).with_changes(
                    "customers",
                    vec![
                        customer("c-1", "ACME", "2024-01-01T10:00:00Z"),
                        customer("c-2", "Globex", "2024-01-01T10:00:00Z"),
                    ],
                ),
                at("2024-01-02T00:00:00Z"),
            )
            .response,
    );
    let mut tombstone = customer("c-2", "Globex", "2024-01-03T10:00:00Z");
    tombstone.insert("is_deleted".into(), json!(true));
    success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(Some(mark_a)).with_changes("customers", vec![tombstone]),
                at("2024-01-04T00:00:00Z"),
            )
            .response,
    );

    // Device B bootstraps: only the live row.
    let (mark_b, bootstrap) = success(
        service
            .serve(&mut dataset, &SyncRequest::new(None), at("2024-01-05T00:00:00Z"))
            .response,
    );
    assert_eq!(uuids(&bootstrap, "customers"), vec!["c-1"]);

    // Nothing changed since, so the next incremental pull is empty.
    let (_, incremental) = success(
        service
            .serve(&mut dataset, &SyncRequest::new(Some(mark_b)), at("2024-01-06T00:00:00Z"))
            .response,
    );
    assert!(incremental.is_empty());

    // Device A's incremental pull since its first sync carries the tombstone.
    let (_, since_a) = success(
        service
            .serve(&mut dataset, &SyncRequest::new(Some(mark_a)), at("2024-01-07T00:00:00Z"))
            .response,
    );
    assert_eq!(uuids(&since_a, "customers"), vec!["c-2"]);
    assert_eq!(since_a["customers"][0]["is_deleted"], json!(true));
}

#[test]
fn consecutive_windows_never_overlap() {
    let schema = Schema::standard();
    let service = SyncService::new(&schema);
    let mut dataset = Dataset::new();
    let wall = at("2024-01-02T00:00:00Z");

    // The wall clock stalls across all three requests.
    let (first, _) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(None)
                    .with_changes("customers", vec![customer("c-1", "ACME", "2024-01-01T00:00:00Z")]),
                wall,
            )
            .response,
    );
    let (second, pulled) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(Some(first))
                    .with_changes("customers", vec![customer("c-2", "Globex", "2024-01-01T00:00:00Z")]),
                wall,
            )
            .response,
    );
    let (third, again) = success(
        service
            .serve(&mut dataset, &SyncRequest::new(Some(second)), wall)
            .response,
    );

    assert!(first < second && second < third);
    assert_eq!(uuids(&pulled, "customers"), vec!["c-2"]);
    assert!(again.is_empty());
}

// ============================================================================
// Conflicts
// ============================================================================

#[test]
fn concurrent_edit_is_reported_then_kept() {
    let schema = Schema::standard();
    let service = SyncService::new(&schema);
    let mut dataset = Dataset::new();

    let (mark, _) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(None)
                    .with_changes("customers", vec![customer("c-1", "ACME", "2024-01-01T00:00:00Z")]),
                at("2024-01-02T00:00:00Z"),
            )
            .response,
    );

    // Device B edits and syncs first.
    success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(Some(mark)).with_changes(
                    "customers",
                    vec![customer("c-1", "ACME S.p.A.", "2024-01-03T00:00:00Z")],
                ),
                at("2024-01-04T00:00:00Z"),
            )
            .response,
    );
    let server_version = dataset.get("customers", "c-1").cloned().unwrap();

    // Device A edited offline from the same watermark.
    let mine = customer("c-1", "ACME Srl", "2024-01-03T12:00:00Z");
    let outcome = service.serve(
        &mut dataset,
        &SyncRequest::new(Some(mark)).with_changes("customers", vec![mine.clone()]),
        at("2024-01-05T00:00:00Z"),
    );
    let conflicts = match outcome.response {
        SyncResponse::Conflict { conflicts } => conflicts,
        other => panic!("expected conflict, got {other:?}"),
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].differing_fields(), vec!["name"]);
    assert_eq!(
        conflicts[0].server_last_modified(),
        Some(server_version.last_modified)
    );
    assert_eq!(dataset.get("customers", "c-1"), Some(&server_version));

    // Keep local: resend with the server version as conflict base.
    let mut resend = mine;
    resend.insert(
        "last_modified".into(),
        json!(timestamp::format(
            &(server_version.last_modified + Duration::microseconds(1))
        )),
    );
    resend.insert(
        "base_last_modified".into(),
        json!(timestamp::format(&server_version.last_modified)),
    );
    let (_, changes) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(Some(mark)).with_changes("customers", vec![resend]),
                at("2024-01-06T00:00:00Z"),
            )
            .response,
    );

    assert_eq!(changes["customers"][0]["name"], json!("ACME Srl"));
    assert!(changes["customers"][0].get("base_last_modified").is_none());
}

#[test]
fn same_edit_on_both_devices_is_not_a_conflict() {
    let schema = Schema::standard();
    let service = SyncService::new(&schema);
    let mut dataset = Dataset::new();

    let (mark, _) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(None)
                    .with_changes("customers", vec![customer("c-1", "ACME", "2024-01-01T00:00:00Z")]),
                at("2024-01-02T00:00:00Z"),
            )
            .response,
    );
    let edit = |lm: &str| customer("c-1", "ACME Srl", lm);

    success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(Some(mark)).with_changes("customers", vec![edit("2024-01-03T00:00:00Z")]),
                at("2024-01-04T00:00:00Z"),
            )
            .response,
    );
    let outcome = service.serve(
        &mut dataset,
        &SyncRequest::new(Some(mark)).with_changes("customers", vec![edit("2024-01-03T06:00:00Z")]),
        at("2024-01-05T00:00:00Z"),
    );

    assert!(outcome.response.is_success());
}

// ============================================================================
// Parents and tombstones
// ============================================================================

#[test]
fn orphan_is_skipped_then_accepted_once_parent_arrives() {
    let schema = Schema::standard();
    let service = SyncService::new(&schema);
    let mut dataset = Dataset::new();

    let first = service.serve(
        &mut dataset,
        &SyncRequest::new(None).with_changes(
            "destinations",
            vec![destination("s-1", "c-1", "2024-01-01T00:00:00Z")],
        ),
        at("2024-01-02T00:00:00Z"),
    );
    assert_eq!(first.plan.as_ref().unwrap().skipped.len(), 1);
    let (mark, _) = success(first.response);
    assert!(dataset.get("destinations", "s-1").is_none());

    let (_, changes) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(Some(mark))
                    .with_changes("customers", vec![customer("c-1", "ACME", "2024-01-01T00:00:00Z")])
                    .with_changes(
                        "destinations",
                        vec![destination("s-1", "c-1", "2024-01-01T00:00:00Z")],
                    ),
                at("2024-01-03T00:00:00Z"),
            )
            .response,
    );
    assert_eq!(uuids(&changes, "destinations"), vec!["s-1"]);
}

#[test]
fn cascaded_tombstones_propagate() {
    let schema = Schema::standard();
    let service = SyncService::new(&schema);
    let mut dataset = Dataset::new();

    let (mark, _) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(None)
                    .with_changes("customers", vec![customer("c-1", "ACME", "2024-01-01T00:00:00Z")])
                    .with_changes(
                        "destinations",
                        vec![destination("s-1", "c-1", "2024-01-01T00:00:00Z")],
                    )
                    .with_changes("devices", vec![device("d-1", "s-1", "2024-01-01T00:00:00Z")]),
                at("2024-01-02T00:00:00Z"),
            )
            .response,
    );

    let tombstone = |mut row: WireRecord| {
        row.insert("is_deleted".into(), json!(true));
        row
    };
    let (_, changes) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(Some(mark))
                    .with_changes(
                        "customers",
                        vec![tombstone(customer("c-1", "ACME", "2024-01-03T00:00:00Z"))],
                    )
                    .with_changes(
                        "destinations",
                        vec![tombstone(destination("s-1", "c-1", "2024-01-03T00:00:00Z"))],
                    )
                    .with_changes(
                        "devices",
                        vec![tombstone(device("d-1", "s-1", "2024-01-03T00:00:00Z"))],
                    ),
                at("2024-01-04T00:00:00Z"),
            )
            .response,
    );

    for table in ["customers", "destinations", "devices"] {
        assert_eq!(changes[table][0]["is_deleted"], json!(true), "{table}");
    }
    assert_eq!(dataset.active_len(), 0);
    assert_eq!(dataset.len(), 3);
}

// ============================================================================
// Identity
// ============================================================================

#[test]
fn independently_created_customer_is_merged() {
    let schema = Schema::standard();
    let rule = CustomerIdentityRule;
    let service = SyncService::new(&schema).with_duplicate_rule(&rule);
    let mut dataset = Dataset::new();

    success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(None)
                    .with_changes("customers", vec![customer("c-a", "ACME", "2024-01-01T00:00:00Z")]),
                at("2024-01-02T00:00:00Z"),
            )
            .response,
    );

    let outcome = service.serve(
        &mut dataset,
        &SyncRequest::new(None)
            .with_changes("customers", vec![customer("c-b", "Acme ", "2024-01-01T00:00:00Z")])
            .with_changes(
                "destinations",
                vec![destination("s-b", "c-b", "2024-01-01T00:00:00Z")],
            ),
        at("2024-01-03T00:00:00Z"),
    );

    match outcome.response {
        SyncResponse::Success { uuid_map, changes, .. } => {
            assert_eq!(uuid_map.get("c-b").map(String::as_str), Some("c-a"));
            assert_eq!(uuids(&changes, "customers"), vec!["c-a"]);
            assert_eq!(changes["destinations"][0]["customer_uuid"], json!("c-a"));
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert!(dataset.get("customers", "c-b").is_none());
}

#[test]
fn signatures_are_keyed_by_username() {
    let schema = Schema::standard();
    let service = SyncService::new(&schema);
    let mut dataset = Dataset::new();
    let signature = |uuid: &str, data: &str, lm: &str| {
        row(json!({
            "uuid": uuid,
            "last_modified": lm,
            "username": "mrossi",
            "signature_data": data,
        }))
    };

    let (mark, _) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(None)
                    .with_changes("signatures", vec![signature("sig-a", "aGVsbG8=", "2024-01-01T00:00:00Z")]),
                at("2024-01-02T00:00:00Z"),
            )
            .response,
    );
    let (_, changes) = success(
        service
            .serve(
                &mut dataset,
                &SyncRequest::new(Some(mark))
                    .with_changes("signatures", vec![signature("sig-b", "d29ybGQ=", "2024-01-03T00:00:00Z")]),
                at("2024-01-04T00:00:00Z"),
            )
            .response,
    );

    assert_eq!(dataset.rows("signatures").count(), 1);
    assert_eq!(changes["signatures"][0]["signature_data"], json!("d29ybGQ="));
}
