//! Read-through cache of test profile definitions.
//!
//! Profiles are read constantly by verification screens and change rarely.
//! The cache loads them once, hands out an immutable shared snapshot and is
//! only refreshed when explicitly invalidated: after a sync apply, after
//! conflict resolution, and after a profile write through the cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use verisync_engine::{codec, RecordUuid, SyncRecord};

use crate::error::Result;
use crate::store::LocalStore;

/// One test step of a profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileTest {
    pub uuid: RecordUuid,
    pub name: String,
    pub parameter: Option<String>,
    pub limits: Value,
    pub is_applied_part_test: bool,
}

/// A profile with its live tests, in creation order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub uuid: RecordUuid,
    pub key: String,
    pub name: String,
    pub tests: Vec<ProfileTest>,
}

/// Immutable view of every live profile, keyed by profile key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSet {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileSet {
    pub fn get(&self, key: &str) -> Option<&Profile> {
        self.profiles.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Shared cache over the local store.
#[derive(Debug)]
pub struct ProfileCache {
    store: LocalStore,
    current: RwLock<Option<Arc<ProfileSet>>>,
}

impl ProfileCache {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    /// The current snapshot, loading it on first use.
    pub async fn get(&self) -> Result<Arc<ProfileSet>> {
        if let Some(set) = self.current.read().await.as_ref() {
            return Ok(Arc::clone(set));
        }

        let mut slot = self.current.write().await;
        if let Some(set) = slot.as_ref() {
            return Ok(Arc::clone(set));
        }
        let set = Arc::new(self.load().await?);
        *slot = Some(Arc::clone(&set));
        Ok(set)
    }

    /// Drop the snapshot; the next read reloads from the store.
    pub async fn invalidate(&self) {
        self.current.write().await.take();
    }

    /// Save a profile or profile test and refresh the cache.
    pub async fn save(&self, table: &str, record: SyncRecord) -> Result<SyncRecord> {
        let saved = self.store.save(table, record).await?;
        self.invalidate().await;
        Ok(saved)
    }

    /// Delete a profile (with its tests) or a single test and refresh the cache.
    pub async fn delete(&self, table: &str, uuid: &str) -> Result<usize> {
        let deleted = self.store.soft_delete(table, uuid).await?;
        self.invalidate().await;
        Ok(deleted)
    }

    async fn load(&self) -> Result<ProfileSet> {
        let mut by_uuid = BTreeMap::new();
        for row in self.store.list("profiles").await? {
            let record = row.record;
            let profile = Profile {
                key: text(&record, "profile_key").unwrap_or_default(),
                name: text(&record, "name").unwrap_or_default(),
                uuid: record.uuid,
                tests: Vec::new(),
            };
            by_uuid.insert(profile.uuid.clone(), profile);
        }

        for row in self.store.list("profile_tests").await? {
            let record = row.record;
            let Some(profile) = record
                .parent
                .as_ref()
                .and_then(|parent| by_uuid.get_mut(parent))
            else {
                continue;
            };
            profile.tests.push(ProfileTest {
                name: text(&record, "name").unwrap_or_default(),
                parameter: text(&record, "parameter"),
                limits: record.field("limits_json").clone(),
                is_applied_part_test: codec::coerce_bool(record.field("is_applied_part_test"))
                    .unwrap_or(false),
                uuid: record.uuid,
            });
        }

        let profiles = by_uuid
            .into_values()
            .map(|profile| (profile.key.clone(), profile))
            .collect();
        Ok(ProfileSet { profiles })
    }
}

fn text(record: &SyncRecord, field: &str) -> Option<String> {
    record.field(field).as_str().map(str::to_string)
}
