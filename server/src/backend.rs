//! Storage backends for the reconciliation service.
//!
//! PostgreSQL is the production store. Without a `DATABASE_URL` the server
//! keeps its dataset in memory, optionally persisted to a JSON snapshot.

use std::path::PathBuf;

use tokio::sync::Mutex;
use verisync_engine::{
    Dataset, DatasetSnapshot, EntityDescriptor, Schema, SchemaVersion, ServeOutcome, SyncRecord,
    SyncRequest, SyncService, Timestamp,
};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::{AppError, Result};

/// Where the authoritative rows live.
pub enum Backend {
    Postgres(Pool),
    Memory(MemoryBackend),
}

impl Backend {
    /// Open the backend selected by `config`, running migrations if needed.
    pub async fn connect(config: &Config, schema: &Schema) -> Result<Self> {
        match &config.database_url {
            Some(url) => {
                let pool = db::create_pool(url, config.max_connections).await?;

                tracing::info!("Running database migrations...");
                db::run_migrations(&pool).await?;

                Ok(Backend::Postgres(pool))
            }
            None => {
                let memory = MemoryBackend::open(config.snapshot_path.clone(), schema).await?;
                Ok(Backend::Memory(memory))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Postgres(_) => "postgres",
            Backend::Memory(_) => "memory",
        }
    }

    /// Serve one sync request.
    pub async fn serve(
        &self,
        service: &SyncService<'_>,
        request: &SyncRequest,
        wall: Timestamp,
    ) -> Result<ServeOutcome> {
        match self {
            Backend::Postgres(pool) => Ok(db::serve_sync(pool, service, request, wall).await?),
            Backend::Memory(memory) => memory.serve(service, request, wall).await,
        }
    }

    /// Store one row outside a sync cycle. The row is stamped with a fresh
    /// as-of timestamp, which is returned with it.
    pub async fn write_stamped(
        &self,
        schema: &Schema,
        entity: &EntityDescriptor,
        record: SyncRecord,
        wall: Timestamp,
    ) -> Result<SyncRecord> {
        match self {
            Backend::Postgres(pool) => Ok(db::write_stamped(pool, entity, record, wall).await?),
            Backend::Memory(memory) => memory.write_stamped(schema, entity, record, wall).await,
        }
    }

    /// Fetch one live row.
    pub async fn read_live(
        &self,
        entity: &EntityDescriptor,
        uuid: &str,
    ) -> Result<Option<SyncRecord>> {
        match self {
            Backend::Postgres(pool) => Ok(db::read_live(pool, entity, uuid).await?),
            Backend::Memory(memory) => Ok(memory.read_live(entity, uuid).await),
        }
    }
}

/// An in-memory dataset; requests are serialised by its mutex.
///
/// Writes are staged on a copy and only swapped in once the snapshot is on
/// disk, so a failed persist leaves the served dataset untouched.
pub struct MemoryBackend {
    dataset: Mutex<Dataset>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryBackend {
    /// Create an empty, unpersisted backend.
    pub fn new() -> Self {
        Self {
            dataset: Mutex::new(Dataset::new()),
            snapshot_path: None,
        }
    }

    /// Open a backend, restoring the snapshot at `path` if there is one.
    pub async fn open(path: Option<PathBuf>, schema: &Schema) -> Result<Self> {
        let dataset = match &path {
            Some(path) if snapshot_exists(path).await? => {
                let json = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AppError::Internal(format!("cannot read snapshot {}: {}", path.display(), e))
                })?;
                let snapshot = DatasetSnapshot::from_json(&json)?;
                snapshot.validate(schema)?;

                tracing::info!(
                    path = %path.display(),
                    rows = snapshot.record_count(),
                    "Restored dataset snapshot"
                );
                Dataset::from_snapshot(snapshot)
            }
            _ => Dataset::new(),
        };

        Ok(Self {
            dataset: Mutex::new(dataset),
            snapshot_path: path,
        })
    }

    async fn serve(
        &self,
        service: &SyncService<'_>,
        request: &SyncRequest,
        wall: Timestamp,
    ) -> Result<ServeOutcome> {
        let mut dataset = self.dataset.lock().await;
        let mut staged = dataset.clone();
        let outcome = service.serve(&mut staged, request, wall);

        let wrote = outcome
            .plan
            .as_ref()
            .is_some_and(|plan| !plan.writes.is_empty());
        if wrote {
            self.persist(&staged, service.schema().version).await?;
        }

        *dataset = staged;
        Ok(outcome)
    }

    async fn write_stamped(
        &self,
        schema: &Schema,
        entity: &EntityDescriptor,
        mut record: SyncRecord,
        wall: Timestamp,
    ) -> Result<SyncRecord> {
        let mut dataset = self.dataset.lock().await;
        let mut staged = dataset.clone();

        record.last_modified = staged.issue_as_of(wall);
        staged.put(entity.name.clone(), record.clone());
        self.persist(&staged, schema.version).await?;

        *dataset = staged;
        Ok(record)
    }

    async fn read_live(&self, entity: &EntityDescriptor, uuid: &str) -> Option<SyncRecord> {
        let dataset = self.dataset.lock().await;
        dataset
            .get(&entity.name, uuid)
            .filter(|record| record.is_active())
            .cloned()
    }

    /// Write the snapshot atomically, if persistence is configured.
    async fn persist(&self, dataset: &Dataset, schema_version: SchemaVersion) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let json = dataset.snapshot(schema_version).to_json()?;
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| AppError::Internal(format!("cannot write snapshot: {}", e)))?;
        tokio::fs::rename(&staging, path)
            .await
            .map_err(|e| AppError::Internal(format!("cannot replace snapshot: {}", e)))?;
        Ok(())
    }
}

async fn snapshot_exists(path: &std::path::Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| AppError::Internal(format!("cannot stat snapshot {}: {}", path.display(), e)))
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}
