//! # Verisync Engine
//!
//! The pure core of an offline-first, bidirectional sync system for a
//! field-service data model: customers, their destinations, the devices
//! installed there and the safety verifications performed on them, plus test
//! profiles, measuring instruments and technician signatures.
//!
//! This crate holds everything both ends of the protocol must agree on, and
//! nothing else.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows nothing of files, sockets or databases
//! - **Deterministic**: the same request against the same rows yields the same plan
//! - **Descriptor driven**: every table is described once in a [`Schema`]
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`SyncRecord`] is a row in wire form: a uuid, a `last_modified`
//! timestamp, a tombstone flag, the parent's uuid for child tables and the
//! table's declared fields. Local integer ids never leave the device.
//!
//! ### Protocol
//!
//! One request carries the client's watermark and its unsynced rows; one
//! response is either a success (new watermark, rows to pull, identity
//! remaps), a conflict list, or an error. See [`protocol`].
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] plans a batch against the server's rows. A row whose
//! server copy changed after the client's watermark, with different content,
//! is a conflict and rejects the whole batch. Identical resends are no-ops.
//! New rows can be folded onto an existing entity by a [`DuplicateRule`].
//!
//! ## Quick Start
//!
//! ```rust
//! use verisync_engine::{timestamp, Dataset, Schema, SyncRequest, SyncResponse, SyncService};
//! use serde_json::json;
//!
//! let schema = Schema::standard();
//! let service = SyncService::new(&schema);
//! let mut dataset = Dataset::new();
//!
//! let row = json!({
//!     "uuid": "3c1d9e2a-0000-4000-8000-000000000001",
//!     "last_modified": "2024-01-31T10:00:00Z",
//!     "name": "ACME",
//! });
//! let request = SyncRequest::new(None)
//!     .with_changes("customers", vec![row.as_object().unwrap().clone()]);
//!
//! let outcome = service.serve(&mut dataset, &request, timestamp::now());
//! assert!(matches!(outcome.response, SyncResponse::Success { .. }));
//! assert_eq!(dataset.active_len(), 1);
//! ```
//!
//! ## Persistence
//!
//! Use [`Dataset::snapshot`] and [`Dataset::from_snapshot`] with
//! [`DatasetSnapshot`]. Snapshots serialize to JSON with deterministic ordering.

pub mod codec;
pub mod conflict;
pub mod dataset;
pub mod error;
pub mod protocol;
pub mod reconcile;
pub mod record;
pub mod remap;
pub mod schema;
pub mod service;
pub mod snapshot;
pub mod timestamp;

// Re-export main types at crate root
pub use codec::{decode_record, encode_record, Decoded};
pub use conflict::{is_conflict, keep_local_timestamp, Decision, Resolution};
pub use dataset::Dataset;
pub use error::Error;
pub use protocol::{
    ChangeSet, ConflictEntry, SkippedChange, SyncRequest, SyncResponse, UuidMap, WireRecord,
};
pub use reconcile::{
    ApplyPlan, CustomerIdentityRule, DuplicateRule, Plan, PlannedWrite, Reconciler, SkipReason,
    SkippedRow, WriteKind,
};
pub use record::SyncRecord;
pub use remap::IdentityRemap;
pub use schema::{EntityDescriptor, FieldDef, FieldType, ParentRef, Schema};
pub use service::{ServeOutcome, SyncService};
pub use snapshot::{DatasetSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use timestamp::{PullWindow, ServerClock, Timestamp};

/// Type aliases for clarity
pub type RecordUuid = String;
pub type TableName = String;
pub type SchemaVersion = u32;
